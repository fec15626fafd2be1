//! Export schema registry.
//!
//! Each archived table declares the columns written to its Parquet
//! export; this module turns those declarations into an Arrow schema and
//! converts fetched rows into record batches.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config::{ColumnSpec, ColumnType};
use datafusion::arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, RecordBatch, StringBuilder,
    TimestampMicrosecondBuilder,
};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

/// A single decoded cell. Decoding happens against the declared column
/// type, so a non-null cell always matches its column.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// One source row: its primary key plus the declared export columns in
/// declaration order.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: i64,
    pub values: Vec<CellValue>,
}

fn arrow_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::Int => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Text => DataType::Utf8,
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

/// Arrow schema for a table's declared export columns.
pub fn arrow_schema(columns: &[ColumnSpec]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.name, arrow_type(c.column_type), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Convert one batch of fetched rows into an Arrow record batch.
pub fn build_record_batch(
    columns: &[ColumnSpec],
    schema: &SchemaRef,
    rows: &[SourceRow],
) -> Result<RecordBatch> {
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());

    for (idx, column) in columns.iter().enumerate() {
        let array: ArrayRef = match column.column_type {
            ColumnType::Int => {
                let mut builder = Int64Builder::with_capacity(rows.len());
                for row in rows {
                    match cell(row, idx, column)? {
                        CellValue::Int(v) => builder.append_value(*v),
                        CellValue::Null => builder.append_null(),
                        other => return Err(type_mismatch(column, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Float => {
                let mut builder = Float64Builder::with_capacity(rows.len());
                for row in rows {
                    match cell(row, idx, column)? {
                        CellValue::Float(v) => builder.append_value(*v),
                        CellValue::Null => builder.append_null(),
                        other => return Err(type_mismatch(column, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Text => {
                let mut builder = StringBuilder::new();
                for row in rows {
                    match cell(row, idx, column)? {
                        CellValue::Text(v) => builder.append_value(v),
                        CellValue::Null => builder.append_null(),
                        other => return Err(type_mismatch(column, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Bool => {
                let mut builder = BooleanBuilder::with_capacity(rows.len());
                for row in rows {
                    match cell(row, idx, column)? {
                        CellValue::Bool(v) => builder.append_value(*v),
                        CellValue::Null => builder.append_null(),
                        other => return Err(type_mismatch(column, other)),
                    }
                }
                Arc::new(builder.finish())
            }
            ColumnType::Timestamp => {
                let mut builder =
                    TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
                for row in rows {
                    match cell(row, idx, column)? {
                        CellValue::Timestamp(v) => builder.append_value(v.timestamp_micros()),
                        CellValue::Null => builder.append_null(),
                        other => return Err(type_mismatch(column, other)),
                    }
                }
                Arc::new(builder.finish())
            }
        };
        arrays.push(array);
    }

    RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|e| anyhow::anyhow!("failed to build record batch: {e}"))
}

fn cell<'a>(row: &'a SourceRow, idx: usize, column: &ColumnSpec) -> Result<&'a CellValue> {
    row.values.get(idx).ok_or_else(|| {
        anyhow::anyhow!(
            "row {} has no value for declared column {}",
            row.id,
            column.name
        )
    })
}

fn type_mismatch(column: &ColumnSpec, value: &CellValue) -> anyhow::Error {
    anyhow::anyhow!(
        "column {} declared {:?} but row holds {:?}",
        column.name,
        column.column_type,
        value
    )
}

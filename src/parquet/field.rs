//! Save an analysis product to a parquet file in long format: one row per
//! defined cell, undefined cells are left out.

use std::{collections::BTreeMap, io::Write, sync::Arc};

use arrow::{
    array::{Float64Builder, StringBuilder, TimestampSecondBuilder, UInt32Builder},
    datatypes::{DataType, Field as ArrowField, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use parquet::{
    arrow::ArrowWriter,
    basic::{Compression, ZstdLevel},
    file::{metadata::KeyValue, properties::WriterProperties},
};

use crate::{error::Result, reading::Field};

const CHUNK_SIZE: usize = 100_000;

struct Builders {
    entity: StringBuilder,
    time: TimestampSecondBuilder,
    row: UInt32Builder,
    col: UInt32Builder,
    variable: StringBuilder,
    value: Float64Builder,
}

impl Builders {
    fn new() -> Self {
        Builders {
            entity: StringBuilder::with_capacity(CHUNK_SIZE, CHUNK_SIZE * 16),
            time: TimestampSecondBuilder::with_capacity(CHUNK_SIZE),
            row: UInt32Builder::with_capacity(CHUNK_SIZE),
            col: UInt32Builder::with_capacity(CHUNK_SIZE),
            variable: StringBuilder::with_capacity(CHUNK_SIZE, CHUNK_SIZE * 8),
            value: Float64Builder::with_capacity(CHUNK_SIZE),
        }
    }

    fn flush<W: Write + Send>(
        &mut self,
        writer: &mut ArrowWriter<W>,
        schema: &Arc<Schema>,
    ) -> Result<()> {
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(self.entity.finish()),
                Arc::new(self.time.finish()),
                Arc::new(self.row.finish()),
                Arc::new(self.col.finish()),
                Arc::new(self.variable.finish()),
                Arc::new(self.value.finish()),
            ],
        )?;

        writer.write(&batch)?;
        Ok(())
    }
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("entity", DataType::Utf8, false),
        ArrowField::new("time", DataType::Timestamp(TimeUnit::Second, None), true),
        ArrowField::new("row", DataType::UInt32, false),
        ArrowField::new("col", DataType::UInt32, false),
        ArrowField::new("variable", DataType::Utf8, true),
        ArrowField::new("value", DataType::Float64, false),
    ]))
}

pub fn save_field<W: Write + Send>(
    field: &Field,
    entity: &str,
    attrs: &BTreeMap<String, String>,
    compressed: bool,
    sink: W,
) -> Result<()> {
    let schema = schema();

    let compression = if compressed {
        Compression::ZSTD(ZstdLevel::default())
    } else {
        Compression::UNCOMPRESSED
    };
    let metadata: Vec<KeyValue> = attrs
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    let props = WriterProperties::builder()
        .set_compression(compression)
        .set_dictionary_enabled(true)
        .set_key_value_metadata(Some(metadata))
        .build();

    let mut writer = ArrowWriter::try_new(sink, schema.clone(), Some(props))?;
    let mut builders = Builders::new();
    let mut batch_rows = 0;

    let (_, cols) = field.shape();
    let named = field.columns.len() == cols;

    for ((row, col), value) in field.values.indexed_iter() {
        if value.is_nan() {
            continue;
        }

        builders.entity.append_value(entity);
        builders
            .time
            .append_option(field.times.get(row).map(|t| t.and_utc().timestamp()));
        builders.row.append_value(row as u32);
        builders.col.append_value(col as u32);
        if named {
            builders.variable.append_value(&field.columns[col]);
        } else {
            builders.variable.append_null();
        }
        builders.value.append_value(*value);

        batch_rows += 1;
        if batch_rows >= CHUNK_SIZE {
            builders.flush(&mut writer, &schema)?;
            batch_rows = 0;
        }
    }

    if batch_rows > 0 {
        builders.flush(&mut writer, &schema)?;
    }

    writer.close()?;
    Ok(())
}

// -- Tests -------------------------------------------------------------------

//! CSV staging for the COPY stream.

use csv::{QuoteStyle, Terminator, WriterBuilder};

use crate::source::{CellValue, NormalizedTable};

/// Write a header line plus one line per row.
///
/// Every field is quoted and null is written as an empty field, which
/// `COPY ... FORCE_NULL` reads back as null. Normalized text is never empty,
/// so no text value, `\N` included, can be mistaken for null.
pub fn stage_csv(table: &NormalizedTable) -> Result<Vec<u8>, csv::Error> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Always)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(table.len() * 64));

    writer.write_record(&table.columns)?;

    for row in &table.rows {
        let record: Vec<String> = (0..table.columns.len())
            .map(|i| match row.get(i) {
                Some(CellValue::Null) | None => String::new(),
                Some(value) => value.to_string(),
            })
            .collect();
        writer.write_record(&record)?;
    }

    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

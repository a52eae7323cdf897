//! CIF full-timetable loader (spec §4.C): fixed-width record parsing
//! (`parser`), record shapes (`types`), and the Store-applying loader
//! (`loader`) that turns a parsed `CIFFile` into a sequence of
//! transactions against a `StoreBackend`.

pub mod loader;
pub mod parser;
pub mod types;

pub use loader::{CifLoader, ScheduleApplyError};
pub use parser::{parse_card, parse_cif_date, CIFParseError};
pub use types::{CIFFile, CIFRecord, CIFUpdateIndicator};

/// Parse a whole CIF extract, one LF-terminated 80-column card per line.
pub fn parse_file(text: &str) -> Result<CIFFile, CIFParseError> {
    let mut file = CIFFile::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        file.push(parser::parse_card(i + 1, line)?);
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_skips_blank_lines() {
        let text = "TD\n\nZZ\n";
        let file = parse_file(text).unwrap();
        assert_eq!(file.records().len(), 2);
    }
}

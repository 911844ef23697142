//! Attachment reference naming

use serde::{Deserialize, Serialize};

/// Reference to a binary attachment stored in the remote attachments folder
///
/// The remote file name is derived deterministically as
/// `<recordType>_<recordId>_<uploadedAtMillis>_<originalFileName>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub file_name: String,
    pub record_type: String,
    pub record_id: String,
    pub uploaded_at_millis: i64,
}

impl AttachmentRef {
    /// Build a reference for a newly uploaded file
    pub fn new(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        uploaded_at_millis: i64,
        original_file_name: &str,
    ) -> Self {
        let record_type = record_type.into();
        let record_id = record_id.into();
        let file_name = format!(
            "{}_{}_{}_{}",
            record_type,
            record_id,
            uploaded_at_millis,
            sanitize(original_file_name)
        );

        Self {
            file_name,
            record_type,
            record_id,
            uploaded_at_millis,
        }
    }

    /// Recover a reference from a remote file name
    ///
    /// Record types and ids must not contain `_` for this to round-trip; the
    /// original file name may.
    pub fn parse(file_name: &str) -> Option<Self> {
        let mut parts = file_name.splitn(4, '_');
        let record_type = parts.next().filter(|s| !s.is_empty())?;
        let record_id = parts.next().filter(|s| !s.is_empty())?;
        let uploaded_at_millis = parts.next()?.parse().ok()?;
        parts.next().filter(|s| !s.is_empty())?;

        Some(Self {
            file_name: file_name.to_string(),
            record_type: record_type.to_string(),
            record_id: record_id.to_string(),
            uploaded_at_millis,
        })
    }

    /// The original file name supplied at upload time
    pub fn original_file_name(&self) -> &str {
        self.file_name.splitn(4, '_').nth(3).unwrap_or("")
    }
}

/// Keep file names flat inside the attachments folder
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_layout() {
        let att = AttachmentRef::new("expense", "e42", 1_735_689_600_000, "receipt.png");
        assert_eq!(att.file_name, "expense_e42_1735689600000_receipt.png");
        assert_eq!(att.original_file_name(), "receipt.png");
    }

    #[test]
    fn test_parse_keeps_underscores_in_original_name() {
        let att = AttachmentRef::parse("note_n1_1700000000000_my_scan_01.pdf").unwrap();
        assert_eq!(att.record_type, "note");
        assert_eq!(att.record_id, "n1");
        assert_eq!(att.uploaded_at_millis, 1_700_000_000_000);
        assert_eq!(att.original_file_name(), "my_scan_01.pdf");
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(AttachmentRef::parse("receipt.png").is_none());
        assert!(AttachmentRef::parse("note_n1_notanumber_file.pdf").is_none());
        assert!(AttachmentRef::parse("note_n1_123_").is_none());
    }

    #[test]
    fn test_path_separators_are_replaced() {
        let att = AttachmentRef::new("note", "n1", 1, "dir/evil\\name.txt");
        assert_eq!(att.original_file_name(), "dir-evil-name.txt");
    }
}

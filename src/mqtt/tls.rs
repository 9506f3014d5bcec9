//! Trust anchor handling.
//!
//! Certificates usually arrive through environment variables, where line
//! breaks get lost or quoted. [`normalize_pem`] rebuilds a standard PEM block:
//! the base64 body is stripped of all whitespace and re-wrapped at 64 columns
//! between freshly written delimiters.

const BEGIN_MARKER: &str = "-----BEGIN CERTIFICATE-----";
const END_MARKER: &str = "-----END CERTIFICATE-----";
const LINE_WIDTH: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PemError {
    #[error("certificate is empty")]
    Empty,

    #[error("certificate has a BEGIN marker but no END marker")]
    Unterminated,

    #[error("certificate body contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Rebuild `raw` into a single 64-column PEM certificate block.
///
/// Input with `BEGIN CERTIFICATE`/`END CERTIFICATE` delimiters keeps only the
/// body between them; input without delimiters is treated as a bare body.
pub fn normalize_pem(raw: &str) -> Result<String, PemError> {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();

    let body = match trimmed.find(BEGIN_MARKER) {
        Some(start) => {
            let after_begin = &trimmed[start + BEGIN_MARKER.len()..];
            let end = after_begin.find(END_MARKER).ok_or(PemError::Unterminated)?;
            &after_begin[..end]
        }
        None => trimmed,
    };

    // Escaped newlines survive some .env loaders verbatim.
    let compact: String = body
        .replace("\\n", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if compact.is_empty() {
        return Err(PemError::Empty);
    }
    if let Some(bad) = compact
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')))
    {
        return Err(PemError::InvalidCharacter(bad));
    }

    let mut pem = String::with_capacity(compact.len() + compact.len() / LINE_WIDTH + 64);
    pem.push_str(BEGIN_MARKER);
    pem.push('\n');
    for line in compact.as_bytes().chunks(LINE_WIDTH) {
        // body is ASCII, every chunk boundary is a char boundary
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(END_MARKER);
    pem.push('\n');
    Ok(pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_lines(pem: &str) -> Vec<&str> {
        pem.lines()
            .filter(|l| !l.starts_with("-----"))
            .collect()
    }

    #[test]
    fn synthesizes_missing_delimiters() {
        let body = "A".repeat(130);
        let pem = normalize_pem(&body).unwrap();

        assert!(pem.starts_with(BEGIN_MARKER));
        assert!(pem.trim_end().ends_with(END_MARKER));
        let lines = body_lines(&pem);
        assert_eq!(lines.iter().map(|l| l.len()).collect::<Vec<_>>(), vec![64, 64, 2]);
    }

    #[test]
    fn rewraps_single_line_certificate() {
        let raw = format!("\"{} {} {} {}\"", BEGIN_MARKER, "QUJD".repeat(20), "RA==", END_MARKER);
        let pem = normalize_pem(&raw).unwrap();

        let lines = body_lines(&pem);
        assert_eq!(lines[0].len(), 64);
        assert_eq!(lines.concat(), format!("{}RA==", "QUJD".repeat(20)));
    }

    #[test]
    fn already_normalized_input_is_stable() {
        let once = normalize_pem(&"Zm9v".repeat(40)).unwrap();
        let twice = normalize_pem(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn strips_escaped_newlines() {
        let raw = format!("{}\\nQUJD\\nREVG\\n{}", BEGIN_MARKER, END_MARKER);
        let pem = normalize_pem(&raw).unwrap();
        assert_eq!(body_lines(&pem), vec!["QUJDREVG"]);
    }

    #[test]
    fn rejects_empty_and_broken_input() {
        assert_eq!(normalize_pem("   "), Err(PemError::Empty));
        assert_eq!(
            normalize_pem(&format!("{}\n{}", BEGIN_MARKER, END_MARKER)),
            Err(PemError::Empty)
        );
        assert_eq!(
            normalize_pem(&format!("{} QUJD", BEGIN_MARKER)),
            Err(PemError::Unterminated)
        );
        assert_eq!(normalize_pem("QUJD*"), Err(PemError::InvalidCharacter('*')));
    }
}

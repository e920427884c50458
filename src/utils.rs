// ABOUTME: Shared helpers for connection strings and identifiers
// ABOUTME: URL sanitizing for logs, identifier validation for unquoted SQL generation

use anyhow::{bail, Result};

/// Normalize a connection string for dialect and backend lookup: trimmed,
/// lowercased, with a leading `jdbc:` removed.
///
/// # Examples
///
/// ```
/// # use table_window_extractor::utils::normalize_connection_string;
/// assert_eq!(
///     normalize_connection_string(" JDBC:PostgreSQL://db/app "),
///     "postgresql://db/app"
/// );
/// ```
pub fn normalize_connection_string(connection_string: &str) -> String {
    let lowered = connection_string.trim().to_lowercase();
    match lowered.strip_prefix("jdbc:") {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// Sanitize a connection string by masking the password component.
///
/// Strings that are not URLs (SQLite file paths, for example) are returned as-is.
pub fn sanitize_url(url: &str) -> String {
    let trimmed = url.trim();
    let (prefix, rest) = match trimmed.strip_prefix("jdbc:") {
        Some(rest) => ("jdbc:", rest),
        None => ("", trimmed),
    };
    if let Ok(mut parsed) = url::Url::parse(rest) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        format!("{}{}", prefix, parsed)
    } else {
        trimmed.to_string()
    }
}

/// Sanitize an identifier for display
///
/// Removes control characters and limits length so identifiers coming from
/// configuration can be logged safely.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Validate an identifier that will be placed unquoted into generated SQL.
///
/// Accepts letters, digits, underscores and `$` (Oracle system sequences use
/// it), and requires the first character to be a letter or underscore.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }
    if trimmed.len() > 128 {
        bail!(
            "Identifier '{}' exceeds maximum length of 128 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let mut chars = trimmed.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(trimmed),
                first
            );
        }
    }
    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '$' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }
    Ok(())
}

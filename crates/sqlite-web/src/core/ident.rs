use crate::error::{AppError, AppResult};

pub const MAX_IDENTIFIER_LEN: usize = 128;

/// `[A-Za-z_][A-Za-z0-9_]*`, at most [`MAX_IDENTIFIER_LEN`] bytes.
///
/// Table, column and index names cannot be bound as parameters, so every name
/// that ends up inside SQL text passes through here first.
pub fn is_valid_identifier(s: &str) -> bool {
    if s.len() > MAX_IDENTIFIER_LEN {
        return false;
    }
    let mut chars = s.chars();
    let Some(first) = chars.next() else { return false };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fails with a validation error naming the identifier and what it was meant to be.
pub fn ensure_identifier(kind: &str, name: &str) -> AppResult<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid {kind} name: {name:?}")))
    }
}

pub fn ensure_identifiers<'a, I>(kind: &str, names: I) -> AppResult<()>
where
    I: IntoIterator<Item = &'a String>,
{
    names.into_iter().try_for_each(|n| ensure_identifier(kind, n))
}

/// Double-quote a name that already passed [`ensure_identifier`].
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_list(names: &[String]) -> String {
    names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", ")
}

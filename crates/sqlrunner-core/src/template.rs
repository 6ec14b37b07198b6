//! `{{.Table}}` placeholder expansion for SQL text.

use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const TABLE_FIELD: &str = ".Table";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed action starting at byte {offset}")]
    Unclosed { offset: usize },

    #[error("empty action at byte {offset}")]
    EmptyAction { offset: usize },

    #[error("unknown field '{field}' at byte {offset}; only {{{{.Table}}}} is supported")]
    UnknownField { field: String, offset: usize },

    #[error("{{{{.Table}}}} at byte {offset} has no ingested table to refer to")]
    NoTable { offset: usize },
}

/// Replace every `{{.Table}}` action in `sql` with `table`.
///
/// Whitespace inside the braces is ignored. Text outside actions, including a
/// stray `}}`, is copied as is.
pub fn expand(sql: &str, table: &str) -> Result<String, TemplateError> {
    render(sql, Some(table))
}

/// Validate `sql` for a context with no ingested table: any `{{.Table}}`
/// action is rejected, other text is returned unchanged.
pub fn expand_without_table(sql: &str) -> Result<String, TemplateError> {
    render(sql, None)
}

fn render(sql: &str, table: Option<&str>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(sql.len() + table.map_or(0, str::len));
    let mut rest = sql;
    let mut consumed = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let offset = consumed + start;
        let body_start = start + OPEN.len();
        let body_len = rest[body_start..]
            .find(CLOSE)
            .ok_or(TemplateError::Unclosed { offset })?;
        let field = rest[body_start..body_start + body_len].trim();

        if field.is_empty() {
            return Err(TemplateError::EmptyAction { offset });
        }
        if field != TABLE_FIELD {
            return Err(TemplateError::UnknownField {
                field: field.to_string(),
                offset,
            });
        }
        out.push_str(table.ok_or(TemplateError::NoTable { offset })?);

        let next = body_start + body_len + CLOSE.len();
        consumed += next;
        rest = &rest[next..];
    }
    out.push_str(rest);
    Ok(out)
}

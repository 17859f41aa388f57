//! Commit message templates.
//!
//! Placeholders use the `{{.Name}}` form, e.g.
//! `Auto-commit: {{.Language}} execution in {{.Buffer}}`. Unknown names and
//! unterminated placeholders are rejected when the template is compiled, so a
//! compiled template always renders.

use crate::error::ConfigError;
use crate::event::ExecutionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Language,
    Environment,
    Buffer,
    Timestamp,
    Success,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "Language" => Some(Field::Language),
            "Environment" => Some(Field::Environment),
            "Buffer" => Some(Field::Buffer),
            "Timestamp" => Some(Field::Timestamp),
            "Success" => Some(Field::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(Field),
}

#[derive(Debug, Clone)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn compile(source: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open.find("}}").ok_or_else(|| {
                ConfigError::InvalidTemplate(format!("unclosed action in {source:?}"))
            })?;
            let action = after_open[..close].trim();
            let name = action.strip_prefix('.').ok_or_else(|| {
                ConfigError::InvalidTemplate(format!("unsupported action {{{{{action}}}}}"))
            })?;
            let field = Field::parse(name).ok_or_else(|| {
                ConfigError::InvalidTemplate(format!("unknown field .{name}"))
            })?;
            segments.push(Segment::Field(field));
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, event: &ExecutionEvent) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Field(Field::Language) => out.push_str(&event.language),
                Segment::Field(Field::Environment) => out.push_str(&event.environment),
                Segment::Field(Field::Buffer) => out.push_str(&event.buffer),
                Segment::Field(Field::Timestamp) => {
                    out.push_str(&event.timestamp.format("%H:%M:%S").to_string())
                }
                Segment::Field(Field::Success) => out.push_str(event.outcome_label()),
            }
        }
        out
    }
}

use crate::{event::Event, serialize::SerializableData};
use dyn_clone::{clone_trait_object, DynClone};
use std::fmt::Write;

/// A pure mapping from an event to a serializable representation. Returning
/// `None` means the formatter produced nothing for this event; each
/// transport has its own policy for that case.
pub trait Formatter: DynClone + Send + Sync {
    fn format(&self, event: &Event) -> Option<SerializableData>;
}

clone_trait_object!(Formatter);

/// Formats the whole event as one JSON document.
#[derive(Clone, Debug, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format(&self, event: &Event) -> Option<SerializableData> {
        serde_json::to_string(event)
            .ok()
            .map(SerializableData::Text)
    }
}

/// How a level is rendered by [`FieldsFormatter`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LevelStyle {
    /// The lowercase level name.
    Name,
    /// The numeric priority.
    Numeric,
}

/// A single field emitted by [`FieldsFormatter`].
#[derive(Clone, Debug)]
pub enum Field {
    /// Event timestamp rendered with a chrono format string.
    Timestamp(String),
    Level(LevelStyle),
    Label,
    Subsystem,
    Category,
    Message,
    EventId,
    /// All tags (scope merged with event) as `key=value` pairs.
    Tags,
    /// All extra values (scope merged with event) as `key=value` pairs.
    Extra,
    Function,
    FileLine,
    ThreadId,
    Fingerprint,
    /// Verbatim text, typically a separator.
    Literal(String),
}

/// A post-processing transform applied to a rendered field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transform {
    Uppercase,
    Lowercase,
    /// Left-pad with spaces to the given width.
    PadLeft(usize),
    /// Right-pad with spaces to the given width.
    PadRight(usize),
}

/// One entry in a [`FieldsFormatter`] layout.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub field: Field,
    pub transform: Option<Transform>,
}

impl FieldSpec {
    pub fn new(field: Field) -> FieldSpec {
        FieldSpec {
            field,
            transform: None,
        }
    }

    pub fn with_transform(field: Field, transform: Transform) -> FieldSpec {
        FieldSpec {
            field,
            transform: Some(transform),
        }
    }
}

/// Renders a configurable ordered list of event fields into one text line.
/// Fields that render empty are skipped together with the separator that
/// would have preceded them; literal fields are always emitted and never
/// separated.
#[derive(Clone, Debug)]
pub struct FieldsFormatter {
    fields: Vec<FieldSpec>,
    separator: String,
}

impl FieldsFormatter {
    pub fn new(fields: Vec<FieldSpec>, separator: &str) -> FieldsFormatter {
        FieldsFormatter {
            fields,
            separator: separator.to_owned(),
        }
    }

    /// `timestamp level label message` with space separators, the layout
    /// most human-readable sinks want.
    pub fn standard() -> FieldsFormatter {
        FieldsFormatter::new(
            vec![
                FieldSpec::new(Field::Timestamp("%Y-%m-%dT%H:%M:%S%.3fZ".to_owned())),
                FieldSpec::with_transform(Field::Level(LevelStyle::Name), Transform::Uppercase),
                FieldSpec::new(Field::Label),
                FieldSpec::new(Field::Message),
                FieldSpec::new(Field::Tags),
            ],
            " ",
        )
    }

    fn render_field(&self, field: &Field, event: &Event) -> String {
        match field {
            Field::Timestamp(format) => event.timestamp.format(format).to_string(),
            Field::Level(LevelStyle::Name) => event.level.as_str().to_owned(),
            Field::Level(LevelStyle::Numeric) => event.level.priority().to_string(),
            Field::Label => event.label.clone(),
            Field::Subsystem => event.subsystem.clone(),
            Field::Category => event.category.clone(),
            Field::Message => event.message.render().to_owned(),
            Field::EventId => event.id.to_simple().to_string(),
            Field::Tags => {
                let mut out = String::new();
                for (key, value) in event.all_tags() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    let _ = write!(out, "{}={}", key, value);
                }
                out
            }
            Field::Extra => {
                let mut out = String::new();
                for (key, value) in event.all_extra() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    let _ = write!(out, "{}={:?}", key, value);
                }
                out
            }
            Field::Function => event.scope.function.clone().unwrap_or_default(),
            Field::FileLine => match (&event.scope.file_name, event.scope.file_line) {
                (Some(file), Some(line)) => format!("{}:{}", file, line),
                (Some(file), None) => file.clone(),
                _ => String::new(),
            },
            Field::ThreadId => event.scope.thread_id.clone().unwrap_or_default(),
            Field::Fingerprint => event.fingerprint.clone().unwrap_or_default(),
            Field::Literal(text) => text.clone(),
        }
    }
}

impl Formatter for FieldsFormatter {
    fn format(&self, event: &Event) -> Option<SerializableData> {
        let mut out = String::new();
        for spec in &self.fields {
            let mut rendered = self.render_field(&spec.field, event);
            if rendered.is_empty() && !matches!(spec.field, Field::Literal(_)) {
                continue;
            }
            if let Some(transform) = spec.transform {
                rendered = match transform {
                    Transform::Uppercase => rendered.to_uppercase(),
                    Transform::Lowercase => rendered.to_lowercase(),
                    Transform::PadLeft(width) => format!("{:>width$}", rendered, width = width),
                    Transform::PadRight(width) => format!("{:<width$}", rendered, width = width),
                };
            }
            let is_literal = matches!(spec.field, Field::Literal(_));
            if !out.is_empty() && !is_literal && !out.ends_with(&self.separator) {
                out.push_str(&self.separator);
            }
            out.push_str(&rendered);
        }
        if out.is_empty() {
            None
        } else {
            Some(SerializableData::Text(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Level;

    fn event() -> Event {
        let mut event = Event::with_message(Level::Warning, "low disk space");
        event.subsystem = "app".to_owned();
        event.category = "storage".to_owned();
        event.label = "app:storage".to_owned();
        event
    }

    #[test]
    fn json_formatter_produces_document() {
        let formatted = JsonFormatter.format(&event()).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(formatted.as_string().unwrap()).unwrap();
        assert_eq!(value["level"], "warning");
        assert_eq!(value["message"], "low disk space");
        assert_eq!(value["label"], "app:storage");
    }

    #[test]
    fn fields_formatter_renders_in_order() {
        let formatter = FieldsFormatter::new(
            vec![
                FieldSpec::with_transform(Field::Level(LevelStyle::Name), Transform::Uppercase),
                FieldSpec::new(Field::Label),
                FieldSpec::new(Field::Message),
            ],
            " | ",
        );
        let formatted = formatter.format(&event()).unwrap();
        assert_eq!(
            formatted.as_string().unwrap(),
            "WARNING | app:storage | low disk space"
        );
    }

    #[test]
    fn empty_fields_are_skipped() {
        let formatter = FieldsFormatter::new(
            vec![
                FieldSpec::new(Field::Fingerprint),
                FieldSpec::new(Field::Message),
            ],
            " ",
        );
        let formatted = formatter.format(&event()).unwrap();
        assert_eq!(formatted.as_string().unwrap(), "low disk space");
    }

    #[test]
    fn numeric_level_and_padding() {
        let formatter = FieldsFormatter::new(
            vec![FieldSpec::with_transform(
                Field::Level(LevelStyle::Numeric),
                Transform::PadLeft(3),
            )],
            " ",
        );
        let formatted = formatter.format(&event()).unwrap();
        assert_eq!(formatted.as_string().unwrap(), "  4");
    }

    #[test]
    fn tags_render_as_key_value_pairs() {
        let mut e = event();
        e.tags.insert("disk".to_owned(), "sda1".to_owned());
        e.scope.tags.insert("env".to_owned(), "prod".to_owned());
        let formatter = FieldsFormatter::new(vec![FieldSpec::new(Field::Tags)], " ");
        let formatted = formatter.format(&e).unwrap();
        assert_eq!(formatted.as_string().unwrap(), "disk=sda1 env=prod");
    }
}

use once_cell::sync::OnceCell;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Write;

/// How much of a placeholder's value may appear in rendered output.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Privacy {
    /// Rendered verbatim.
    Public,
    /// Replaced with a redaction marker.
    Private,
    /// Replaced with a stable 64-bit hash of the value.
    PrivateHashed,
    /// First and last characters kept, the rest masked.
    PartiallyHidden,
}

/// A typed value captured by a message placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaceholderValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Fixed-width padding applied to a rendered placeholder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pad {
    pub width: usize,
    pub fill: char,
}

/// One segment of a message: either literal text or a placeholder that is
/// realized when the message is first rendered.
#[derive(Clone, Debug)]
pub enum Segment {
    Literal(String),
    Placeholder {
        value: PlaceholderValue,
        /// Optional format spec: a radix ("x", "X", "o", "b") for integers,
        /// or a precision digit count for floats.
        format: Option<String>,
        pad: Option<Pad>,
        privacy: Privacy,
    },
}

/// Structured message text. The segments are kept unrendered until a
/// transport or formatter first asks for the text; the realized string is
/// cached so interpolation happens at most once per event.
#[derive(Clone, Debug, Default)]
pub struct Message {
    segments: Vec<Segment>,
    rendered: OnceCell<String>,
}

impl Message {
    pub fn new(segments: Vec<Segment>) -> Self {
        Message {
            segments,
            rendered: OnceCell::new(),
        }
    }

    /// A message consisting of a single literal segment.
    pub fn literal<S: Into<String>>(text: S) -> Self {
        Message::new(vec![Segment::Literal(text.into())])
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Realizes the message text, applying formats, padding and privacy.
    /// The result is computed on first call and cached.
    pub fn render(&self) -> &str {
        self.rendered.get_or_init(|| {
            let mut out = String::new();
            for segment in &self.segments {
                match segment {
                    Segment::Literal(text) => out.push_str(text),
                    Segment::Placeholder {
                        value,
                        format,
                        pad,
                        privacy,
                    } => {
                        let realized = realize(value, format.as_deref());
                        let concealed = conceal(&realized, *privacy);
                        match pad {
                            Some(pad) => {
                                for _ in concealed.chars().count()..pad.width {
                                    out.push(pad.fill);
                                }
                                out.push_str(&concealed);
                            }
                            None => out.push_str(&concealed),
                        }
                    }
                }
            }
            out
        })
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::literal(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::literal(text)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.render() == other.render()
    }
}

// The wire representation of a message is its rendered text. Deserializing
// yields a single-literal message, which renders back to the same text.
impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.render())
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Message::literal(String::deserialize(deserializer)?))
    }
}

fn realize(value: &PlaceholderValue, format: Option<&str>) -> String {
    match value {
        PlaceholderValue::Str(s) => s.clone(),
        PlaceholderValue::Bool(b) => b.to_string(),
        PlaceholderValue::Int(i) => match format {
            Some("x") => format!("{:x}", i),
            Some("X") => format!("{:X}", i),
            Some("o") => format!("{:o}", i),
            Some("b") => format!("{:b}", i),
            _ => i.to_string(),
        },
        PlaceholderValue::Float(f) => match format.and_then(|f| f.parse::<usize>().ok()) {
            Some(precision) => {
                let mut s = String::new();
                // Infallible for String targets.
                let _ = write!(s, "{:.*}", precision, f);
                s
            }
            None => f.to_string(),
        },
    }
}

fn conceal(realized: &str, privacy: Privacy) -> String {
    match privacy {
        Privacy::Public => realized.to_owned(),
        Privacy::Private => "<redacted>".to_owned(),
        Privacy::PrivateHashed => format!("{:016x}", fnv1a(realized.as_bytes())),
        Privacy::PartiallyHidden => {
            let chars: Vec<char> = realized.chars().collect();
            if chars.len() <= 2 {
                "*".repeat(chars.len())
            } else {
                let mut out = String::new();
                out.push(chars[0]);
                out.push_str(&"*".repeat(chars.len() - 2));
                out.push(chars[chars.len() - 1]);
                out
            }
        }
    }
}

/// FNV-1a, used so hashed placeholders are stable across processes and Rust
/// versions (std's DefaultHasher makes no such promise).
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

//! Edit commands sent to the simulation session.
//!
//! Every network change the engine makes is an [`EditCommand`]. The ordered list
//! of commands is both the replay script for [`SimulationSession::reload`] and
//! the text written to the redirect files of an upgraded circuit, so rendering
//! must be deterministic: properties keep insertion order and numbers are
//! formatted with a fixed precision.
//!
//! ```
//! use upgrade_core::command::{EditCommand, ElementClass};
//!
//! let cmd = EditCommand::edit(ElementClass::Line, "l12")
//!     .with("linecode", "lc_600")
//!     .with("normamps", 600.0);
//! assert_eq!(cmd.to_string(), "Edit Line.l12 linecode=lc_600 normamps=600");
//! ```
//!
//! [`SimulationSession::reload`]: crate::session::SimulationSession::reload

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element classes the engine reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ElementClass {
    Line,
    LineCode,
    LineGeometry,
    Transformer,
    Capacitor,
    CapControl,
    RegControl,
    PvSystem,
}

impl ElementClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementClass::Line => "Line",
            ElementClass::LineCode => "LineCode",
            ElementClass::LineGeometry => "LineGeometry",
            ElementClass::Transformer => "Transformer",
            ElementClass::Capacitor => "Capacitor",
            ElementClass::CapControl => "CapControl",
            ElementClass::RegControl => "RegControl",
            ElementClass::PvSystem => "PVSystem",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "line" => Some(ElementClass::Line),
            "linecode" => Some(ElementClass::LineCode),
            "linegeometry" => Some(ElementClass::LineGeometry),
            "transformer" => Some(ElementClass::Transformer),
            "capacitor" => Some(ElementClass::Capacitor),
            "capcontrol" => Some(ElementClass::CapControl),
            "regcontrol" => Some(ElementClass::RegControl),
            "pvsystem" => Some(ElementClass::PvSystem),
            _ => None,
        }
    }
}

impl fmt::Display for ElementClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fully qualified element name, e.g. `Line.l12`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementRef {
    pub class: ElementClass,
    pub name: String,
}

impl ElementRef {
    pub fn new(class: ElementClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }

    /// Parse `Class.name`; names are lower-cased the way the circuit reports them.
    pub fn parse(value: &str) -> Option<Self> {
        let (class, name) = value.split_once('.')?;
        let class = ElementClass::parse(class)?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(class, name.to_ascii_lowercase()))
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    New,
    Edit,
    Disable,
    Enable,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::New => "New",
            Verb::Edit => "Edit",
            Verb::Disable => "Disable",
            Verb::Enable => "Enable",
        }
    }
}

/// A single property assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// Values that can be rendered as a property.
pub trait PropertyValue {
    fn render(&self) -> String;
}

impl PropertyValue for f64 {
    fn render(&self) -> String {
        format_number(*self)
    }
}

impl PropertyValue for u32 {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl PropertyValue for usize {
    fn render(&self) -> String {
        self.to_string()
    }
}

impl PropertyValue for bool {
    fn render(&self) -> String {
        if *self { "true" } else { "false" }.to_string()
    }
}

impl PropertyValue for &str {
    fn render(&self) -> String {
        (*self).to_string()
    }
}

impl PropertyValue for String {
    fn render(&self) -> String {
        self.clone()
    }
}

impl PropertyValue for &String {
    fn render(&self) -> String {
        (*self).clone()
    }
}

/// Fixed-precision number rendering so replayed scripts are byte-identical.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "0".to_string();
    }
    let text = format!("{:.6}", value);
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Render a list property as `[a, b, c]`.
pub fn format_list<T: PropertyValue>(values: &[T]) -> String {
    let items: Vec<String> = values.iter().map(PropertyValue::render).collect();
    format!("[{}]", items.join(", "))
}

/// Split a rendered list property back into its items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .trim()
        .trim_start_matches(['[', '(', '"', '\''])
        .trim_end_matches([']', ')', '"', '\''])
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditCommand {
    pub verb: Verb,
    pub element: ElementRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
}

impl EditCommand {
    fn with_verb(verb: Verb, class: ElementClass, name: impl Into<String>) -> Self {
        Self {
            verb,
            element: ElementRef::new(class, name),
            properties: Vec::new(),
        }
    }

    /// `New Class.name ...`
    pub fn create(class: ElementClass, name: impl Into<String>) -> Self {
        Self::with_verb(Verb::New, class, name)
    }

    /// `Edit Class.name ...`
    pub fn edit(class: ElementClass, name: impl Into<String>) -> Self {
        Self::with_verb(Verb::Edit, class, name)
    }

    pub fn disable(class: ElementClass, name: impl Into<String>) -> Self {
        Self::with_verb(Verb::Disable, class, name)
    }

    pub fn enable(class: ElementClass, name: impl Into<String>) -> Self {
        Self::with_verb(Verb::Enable, class, name)
    }

    pub fn with(mut self, key: &str, value: impl PropertyValue) -> Self {
        self.properties.push(Property {
            key: key.to_string(),
            value: value.render(),
        });
        self
    }

    pub fn with_list<T: PropertyValue>(mut self, key: &str, values: &[T]) -> Self {
        self.properties.push(Property {
            key: key.to_string(),
            value: format_list(values),
        });
        self
    }

    /// Case-insensitive property lookup; the last assignment wins.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .rev()
            .find(|p| p.key.eq_ignore_ascii_case(key))
            .map(|p| p.value.as_str())
    }

    pub fn targets(&self, class: ElementClass, name: &str) -> bool {
        self.element.class == class && self.element.name.eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for EditCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb.as_str(), self.element)?;
        for property in &self.properties {
            write!(f, " {}={}", property.key, property.value)?;
        }
        Ok(())
    }
}

/// Render a command script, one command per line.
pub fn render_script(commands: &[EditCommand]) -> String {
    let mut buffer = String::new();
    for command in commands {
        buffer.push_str(&command.to_string());
        buffer.push('\n');
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting_is_stable() {
        assert_eq!(format_number(600.0), "600");
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-0.0000001), "0");
        assert_eq!(format_number(119.25), "119.25");
    }

    #[test]
    fn test_new_transformer_rendering() {
        let cmd = EditCommand::create(ElementClass::Transformer, "t1_upgrade")
            .with("phases", 3u32)
            .with_list("buses", &["a", "b"])
            .with_list("kvas", &[750.0, 750.0]);
        assert_eq!(
            cmd.to_string(),
            "New Transformer.t1_upgrade phases=3 buses=[a, b] kvas=[750, 750]"
        );
    }

    #[test]
    fn test_property_lookup_is_case_insensitive() {
        let cmd = EditCommand::edit(ElementClass::CapControl, "cc1")
            .with("ONsetting", 118.0)
            .with("onsetting", 117.0);
        assert_eq!(cmd.property("onsetting"), Some("117"));
        assert_eq!(cmd.property("offsetting"), None);
    }

    #[test]
    fn test_parse_list_round_trip() {
        assert_eq!(parse_list("[a, b c]"), vec!["a", "b", "c"]);
        assert_eq!(parse_list("wye"), vec!["wye"]);
    }

    #[test]
    fn test_element_ref_parse() {
        let element = ElementRef::parse("Line.L12").unwrap();
        assert_eq!(element.class, ElementClass::Line);
        assert_eq!(element.name, "l12");
        assert!(ElementRef::parse("Bogus.x").is_none());
        assert!(ElementRef::parse("Line.").is_none());
    }

    #[test]
    fn test_render_script() {
        let script = render_script(&[
            EditCommand::disable(ElementClass::RegControl, "r1"),
            EditCommand::enable(ElementClass::RegControl, "r1"),
        ]);
        assert_eq!(script, "Disable RegControl.r1\nEnable RegControl.r1\n");
    }
}

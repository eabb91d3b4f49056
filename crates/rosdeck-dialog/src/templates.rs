//! Static field-descriptor templates, keyed by the `type` tag the robot puts
//! on a dialog question.

use rosdeck_types::{FieldDescriptor, FieldOption, FieldType, LookupSource};

/// Resolve a type tag to its template, labelled `label`.
///
/// Tags are matched case-insensitively. Returns `None` for tags with no
/// template; callers fall back to free text.
pub fn template_for(tag: &str, label: &str) -> Option<FieldDescriptor> {
    let mut descriptor = FieldDescriptor::text(label);
    match tag.trim().to_ascii_lowercase().as_str() {
        "text" | "string" | "str" => {}
        "int" | "integer" => {
            descriptor.field_type = FieldType::Int;
            descriptor.step = Some(1.0);
        }
        "float" | "double" | "decimal" | "number" => {
            descriptor.field_type = FieldType::Float;
            descriptor.step = Some(0.01);
        }
        "position" => {
            descriptor.field_type = FieldType::Combobox;
            descriptor.needs_lookup = true;
            descriptor.lookup = Some(LookupSource::Position);
        }
        "marker" => {
            descriptor.field_type = FieldType::Combobox;
            descriptor.needs_lookup = true;
            descriptor.lookup = Some(LookupSource::Marker);
        }
        "bool" | "boolean" | "yes_no" | "yesno" => {
            descriptor.field_type = FieldType::Bool;
            descriptor.options = vec![FieldOption::new("Yes", "true"), FieldOption::new("No", "false")];
        }
        "message" | "info" => {
            descriptor.field_type = FieldType::Message;
            descriptor.read_only = true;
        }
        _ => return None,
    }
    Some(descriptor)
}

/// Whether `tag` names a known template.
pub fn is_known_tag(tag: &str) -> bool {
    template_for(tag, "").is_some()
}

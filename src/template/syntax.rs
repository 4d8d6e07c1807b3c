use regex::Regex;
use std::sync::LazyLock;

static VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("valid variable regex"));
static EMPTY_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\}\}").expect("valid empty placeholder regex"));
static ANY_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^}]*)\}\}").expect("valid placeholder regex"));
static NESTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^}]*\{\{").expect("valid nesting regex"));
static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w+$").expect("valid word regex"));

/// Placeholder names in order of first appearance, without duplicates.
pub fn extract_variables(content: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for capture in VARIABLE.captures_iter(content) {
        let name = &capture[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Human-readable syntax errors; an empty list means the template is valid.
pub fn validate_syntax(content: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let opening = content.matches("{{").count();
    let closing = content.matches("}}").count();
    if opening != closing {
        errors.push(format!(
            "Số lượng dấu mở '{{{{' ({}) và đóng '}}}}' ({}) không khớp",
            opening, closing
        ));
    }

    if EMPTY_PLACEHOLDER.is_match(content) {
        errors.push("Có biến rỗng {{}} trong template".to_string());
    }

    for capture in ANY_PLACEHOLDER.captures_iter(content) {
        let name = capture[1].trim();
        if !name.is_empty() && !WORD.is_match(name) {
            errors.push(format!(
                "Tên biến không hợp lệ: '{}'. Chỉ được dùng chữ, số và dấu gạch dưới",
                name
            ));
        }
    }

    if NESTED.is_match(content) {
        errors.push("Không được lồng biến trong biến".to_string());
    }

    errors
}

/// Replaces `{{name}}` tokens using `lookup`; tokens it returns `None` for stay.
pub fn substitute<F>(content: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    VARIABLE
        .replace_all(content, |caps: &regex::Captures| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_variables_dedupes_in_order() {
        let names = extract_variables(
            "Chào {{student_name}}, môn {{subject}} hạn {{deadline}}. Nhắc lại {{subject}}.",
        );
        assert_eq!(names, vec!["student_name", "subject", "deadline"]);
    }

    #[test]
    fn test_extract_variables_accepts_unicode_names() {
        assert_eq!(extract_variables("{{tên_lớp}} {{ bad }}"), vec!["tên_lớp"]);
    }

    #[test]
    fn test_valid_template() {
        assert!(validate_syntax("Deadline môn {{subject}} là {{deadline}}").is_empty());
        assert!(validate_syntax("Không có biến nào").is_empty());
    }

    #[test]
    fn test_mismatched_braces() {
        let errors = validate_syntax("Hạn {{deadline");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("không khớp"));
    }

    #[test]
    fn test_empty_and_invalid_names() {
        let errors = validate_syntax("{{ }} và {{tên sv}}");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("rỗng"));
        assert!(errors[1].contains("tên sv"));
    }

    #[test]
    fn test_nested_placeholder() {
        let errors = validate_syntax("{{a{{b}}}}");
        assert!(errors.iter().any(|e| e.contains("lồng")));
    }

    #[test]
    fn test_substitute_leaves_unknown() {
        let out = substitute("{{a}} + {{b}}", |name| {
            (name == "a").then(|| "1".to_string())
        });
        assert_eq!(out, "1 + {{b}}");
    }
}

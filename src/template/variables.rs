use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::Payload;

/// Recognized variable names with their Vietnamese description and an example value.
const COMMON_VARIABLES: &[(&str, &str, &str)] = &[
    ("student_name", "Tên sinh viên", "Nguyễn Văn A"),
    ("subject", "Tên môn học", "Lập trình Python"),
    ("course_code", "Mã môn học", "IT101"),
    ("deadline", "Thời hạn nộp bài", "23:59 ngày 31/12/2024"),
    ("assignment_name", "Tên bài tập/assignment", "Bài tập lớn số 1"),
    ("score", "Điểm số", "8.5"),
    ("date", "Ngày tháng", "15/01/2025"),
    ("time", "Thời gian", "14:00"),
    ("location", "Địa điểm", "Phòng A101"),
    ("teacher_name", "Tên giảng viên", "TS. Trần Văn B"),
    ("note", "Ghi chú", "Mang theo laptop"),
    ("requirement", "Yêu cầu", "Nộp file PDF"),
    ("class_name", "Tên lớp", "CNTT-K20"),
    ("semester", "Học kỳ", "Học kỳ 1"),
    ("academic_year", "Năm học", "2024-2025"),
];

/// Informal spellings mapped to standard names.
const ALIASES: &[(&str, &str)] = &[
    ("ten_sv", "student_name"),
    ("tensv", "student_name"),
    ("ten_sinh_vien", "student_name"),
    ("hoten", "student_name"),
    ("monhoc", "subject"),
    ("mon", "subject"),
    ("ma_mon", "course_code"),
    ("mamh", "course_code"),
    ("han_nop", "deadline"),
    ("hannop", "deadline"),
    ("thoi_han", "deadline"),
    ("diem_so", "score"),
    ("diemso", "score"),
    ("ngay", "date"),
    ("thoi_gian", "time"),
    ("thoigian", "time"),
    ("dia_diem", "location"),
    ("diadiem", "location"),
    ("ghi_chu", "note"),
    ("ghichu", "note"),
    ("yeu_cau", "requirement"),
    ("yeucau", "requirement"),
];

const OPTIONAL_VARIABLES: &[&str] = &["note", "ghi_chu", "description"];

const STOP_WORDS: &[&str] = &["là", "gì", "khi", "nào", "của", "cho", "và", "hoặc", "với"];

const MAX_QUERY_WORDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    String,
    Date,
    Time,
    Number,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub description: String,
    pub required: bool,
    pub default_value: Option<String>,
    pub kind: VariableKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonVariable {
    pub name: String,
    pub description: String,
    pub example: String,
}

pub fn common_variables() -> Vec<CommonVariable> {
    COMMON_VARIABLES
        .iter()
        .map(|(name, description, example)| CommonVariable {
            name: name.to_string(),
            description: description.to_string(),
            example: example.to_string(),
        })
        .collect()
}

pub fn describe(name: &str) -> Option<&'static str> {
    COMMON_VARIABLES
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, description, _)| *description)
}

pub fn is_standard_variable(name: &str) -> bool {
    describe(name).is_some()
}

/// Infers description, requiredness and value kind from a variable name.
pub fn analyze_variable(name: &str) -> VariableInfo {
    let lower = name.to_lowercase();

    let kind = if ["date", "deadline", "ngay"].iter().any(|k| lower.contains(k)) {
        VariableKind::Date
    } else if ["time", "gio"].iter().any(|k| lower.contains(k)) {
        VariableKind::Time
    } else if ["score", "diem", "number", "so"].iter().any(|k| lower.contains(k)) {
        VariableKind::Number
    } else {
        VariableKind::String
    };

    VariableInfo {
        name: name.to_string(),
        description: describe(name)
            .map(str::to_string)
            .unwrap_or_else(|| format!("Biến {}", name)),
        required: !OPTIONAL_VARIABLES.contains(&lower.as_str()),
        default_value: None,
        kind,
    }
}

/// Standard name for a non-standard variable, by alias or partial match.
pub fn suggest_standard_name(name: &str) -> Option<&'static str> {
    let lower = name.to_lowercase();
    if let Some((_, standard)) = ALIASES.iter().find(|(alias, _)| *alias == lower) {
        return Some(standard);
    }

    ALIASES
        .iter()
        .find(|(alias, _)| lower.contains(alias) || alias.contains(lower.as_str()))
        .map(|(_, standard)| *standard)
}

/// Retrieval query from the question, string context values and the
/// descriptions of recognized variables. Words are de-duplicated
/// case-insensitively, stop words dropped, and the result capped.
pub fn build_search_query(question: &str, variables: &[String], context: &Payload) -> String {
    let mut parts: Vec<String> = vec![question.to_string()];
    parts.extend(context.values().filter_map(|v| match v {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }));
    parts.extend(
        variables
            .iter()
            .filter_map(|v| describe(v))
            .map(str::to_string),
    );

    let mut seen: Vec<String> = Vec::new();
    let mut words: Vec<&str> = Vec::new();
    let joined = parts.join(" ");
    for word in joined.split_whitespace() {
        let lower = word.to_lowercase();
        if STOP_WORDS.contains(&lower.as_str()) || seen.contains(&lower) {
            continue;
        }
        seen.push(lower);
        words.push(word);
        if words.len() == MAX_QUERY_WORDS {
            break;
        }
    }

    words.join(" ")
}

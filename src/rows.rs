//! Row Processor - store records to substituted copy
//!
//! Columns are looked up by their exact survey header text. A header that
//! does not match simply reads as blank.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

pub type RowRecord = HashMap<String, String>;

pub const WEBSITE_URL_LABEL: &str = "오터오더 사이트";
pub const STORE_NAME_LABEL: &str =
    "오터오더를 사용하려는 브랜드 이름을 알려주세요. (여러개인 경우 , 로 구분하여 입력)";
pub const POSTER_DESIGN_LABEL: &str =
    "[포스터 1장 기본 제공] 선호하는 디자인을 골라주세요. (A2 사이즈)";
pub const POSTER_COPY_LABEL: &str = "포스터에 들어갈 문구를 선택하세요.";
pub const FLYER_DESIGN_LABEL: &str =
    "[전단지 300장 기본 제공] 선호하는 디자인을 선택하세요. (A5 사이즈)";
pub const FLYER_COPY_LABEL: &str = "전단지에 들어갈 문구를 선택하세요.";
pub const DISCOUNT_AMOUNT_LABEL: &str =
    "전단지에 삽입할 주문 건별 할인 예정 금액을 알려주세요.";

pub const STORE_NAME_TOKEN: &str = "[식당이름]";
pub const DISCOUNT_TOKEN: &str = "[{n,000원}]";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreFields {
    pub website_url: String,
    pub store_name: String,
    pub poster_design: String,
    pub poster_copy: String,
    pub flyer_design: String,
    pub flyer_copy: String,
    pub discount_amount: String,
}

/// The row has no usable store name; skip it and move on.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Missing store name, skipping")]
pub struct SkipRow;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid design option format: \"{0}\". Expected format: \"옵션 1\", \"옵션 2\", etc.")]
pub struct InvalidDesignOption(pub String);

fn field(row: &RowRecord, label: &str) -> String {
    row.get(label).cloned().unwrap_or_default()
}

pub fn extract_fields(row: &RowRecord) -> Result<StoreFields, SkipRow> {
    let store_name = field(row, STORE_NAME_LABEL);
    if store_name.trim().is_empty() {
        return Err(SkipRow);
    }
    Ok(StoreFields {
        website_url: field(row, WEBSITE_URL_LABEL),
        store_name,
        poster_design: field(row, POSTER_DESIGN_LABEL),
        poster_copy: field(row, POSTER_COPY_LABEL),
        flyer_design: field(row, FLYER_DESIGN_LABEL),
        flyer_copy: field(row, FLYER_COPY_LABEL),
        discount_amount: field(row, DISCOUNT_AMOUNT_LABEL),
    })
}

/// Fill in the store name, fill in or drop the discount, then trim.
pub fn substitute(text: &str, store_name: &str, discount_amount: &str) -> String {
    let discount = if discount_amount.trim().is_empty() {
        ""
    } else {
        discount_amount
    };
    text.replace(STORE_NAME_TOKEN, store_name)
        .replace(DISCOUNT_TOKEN, discount)
        .trim()
        .to_string()
}

fn design_option_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"옵션\s*([0-9]+)").expect("design option pattern is valid")
    })
}

/// `"옵션 2"` → `"Design 2"`.
pub fn map_design_option(label: &str) -> Result<String, InvalidDesignOption> {
    design_option_pattern()
        .captures(label)
        .and_then(|caps| caps.get(1))
        .map(|number| format!("Design {}", number.as_str()))
        .ok_or_else(|| InvalidDesignOption(label.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RowRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_defaults_optional_fields() {
        let fields = extract_fields(&row(&[(STORE_NAME_LABEL, "Cafe A")])).unwrap();
        assert_eq!(fields.store_name, "Cafe A");
        assert_eq!(fields.website_url, "");
        assert_eq!(fields.discount_amount, "");
    }

    #[test]
    fn test_blank_store_name_skips() {
        assert_eq!(
            extract_fields(&row(&[(STORE_NAME_LABEL, "   ")])),
            Err(SkipRow)
        );
        assert_eq!(
            extract_fields(&row(&[(POSTER_DESIGN_LABEL, "옵션 1")])),
            Err(SkipRow)
        );
    }

    #[test]
    fn test_labels_are_exact_match() {
        let fields = extract_fields(&row(&[
            (STORE_NAME_LABEL, "Cafe A"),
            ("오터오더 사이트 ", "https://example.com"),
        ]))
        .unwrap();
        assert_eq!(fields.website_url, "");
    }

    #[test]
    fn test_substitute_removes_blank_discount() {
        assert_eq!(
            substitute("[식당이름] 안녕 [{n,000원}]", "Cafe A", ""),
            "Cafe A 안녕"
        );
        assert_eq!(
            substitute("[식당이름] 안녕 [{n,000원}]", "Cafe A", "  "),
            "Cafe A 안녕"
        );
    }

    #[test]
    fn test_substitute_replaces_every_occurrence() {
        assert_eq!(substitute("[식당이름]", "Cafe B", "5"), "Cafe B");
        assert_eq!(
            substitute(
                "[식당이름]에서 [{n,000원}] 할인! [식당이름] [{n,000원}]",
                "Cafe B",
                "5"
            ),
            "Cafe B에서 5 할인! Cafe B 5"
        );
    }

    #[test]
    fn test_substitute_is_noop_without_tokens() {
        let once = substitute("  plain copy ", "Cafe", "3");
        assert_eq!(once, "plain copy");
        assert_eq!(substitute(&once, "Cafe", "3"), once);
    }

    #[test]
    fn test_map_design_option() {
        assert_eq!(map_design_option("옵션 2").unwrap(), "Design 2");
        assert_eq!(map_design_option("옵션12").unwrap(), "Design 12");
        assert_eq!(
            map_design_option("디자인 옵션 3 (추천)").unwrap(),
            "Design 3"
        );
    }

    #[test]
    fn test_map_design_option_rejects_other_labels() {
        let err = map_design_option("foo").unwrap_err();
        assert_eq!(err, InvalidDesignOption("foo".to_string()));
        assert!(err.to_string().contains("Expected format"));
        assert!(map_design_option("Design 1").is_err());
    }
}

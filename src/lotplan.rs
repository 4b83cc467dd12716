//! Cadastral lot/plan identifiers.
//!
//! Queensland identifiers concatenate lot and plan (`13SP181800`). NSW-style
//! deposited plans and anything carrying a section number use the slash form
//! (`3/DP45678`, `2/5/DP12345`).

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LotPlanError {
    #[error("empty lot/plan")]
    Empty,
    #[error("unrecognised lot/plan {0:?}")]
    Unrecognised(String),
}

/// A normalized lot/plan identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(into = "String")]
pub struct LotPlan {
    lot: String,
    section: Option<String>,
    plan: String,
}

impl LotPlan {
    /// Parse free-form user input such as `Lot 2 Section 5 DP 12345`.
    ///
    /// # Errors
    /// Returns an error when no `<lot digits><plan letters><plan digits>`
    /// sequence can be found.
    pub fn parse(input: &str) -> Result<Self, LotPlanError> {
        let upper = input.trim().to_uppercase();
        if upper.is_empty() {
            return Err(LotPlanError::Empty);
        }

        // Already-normalized slash forms.
        if upper.contains('/') {
            let parts: Vec<&str> = upper.split('/').map(str::trim).collect();
            match parts.as_slice() {
                [lot, plan] if is_lot(lot) && is_plan(plan) => {
                    return Ok(Self::from_parts(lot, None, plan));
                }
                [lot, section, plan] if is_lot(lot) && is_lot(section) && is_plan(plan) => {
                    return Ok(Self::from_parts(lot, Some(section), plan));
                }
                _ => {}
            }
        }

        let cleaned: String = upper
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect();

        let mut section = None;
        let mut rest = String::new();
        let mut tokens = cleaned.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            match token {
                "LOT" | "PLAN" | "ON" => {}
                "SECTION" | "SEC" => {
                    if let Some(next) = tokens.peek().filter(|t| is_lot(t)) {
                        section = Some((*next).to_string());
                        tokens.next();
                    }
                }
                other => rest.push_str(other),
            }
        }

        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| LotPlanError::Unrecognised(input.to_string()))?;
        let (lot, plan) = rest.split_at(split);
        if !is_lot(lot) || !is_plan(plan) {
            return Err(LotPlanError::Unrecognised(input.to_string()));
        }
        Ok(Self::from_parts(lot, section.as_deref(), plan))
    }

    fn from_parts(lot: &str, section: Option<&str>, plan: &str) -> Self {
        Self {
            lot: strip_leading_zeros(lot),
            section: section.map(strip_leading_zeros),
            plan: plan.to_string(),
        }
    }

    #[must_use]
    pub fn lot(&self) -> &str {
        &self.lot
    }

    #[must_use]
    pub fn section(&self) -> Option<&str> {
        self.section.as_deref()
    }

    #[must_use]
    pub fn plan(&self) -> &str {
        &self.plan
    }

    fn uses_slash_form(&self) -> bool {
        self.section.is_some() || self.plan.starts_with("DP")
    }
}

impl fmt::Display for LotPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.section, self.uses_slash_form()) {
            (Some(section), _) => write!(f, "{}/{}/{}", self.lot, section, self.plan),
            (None, true) => write!(f, "{}/{}", self.lot, self.plan),
            (None, false) => write!(f, "{}{}", self.lot, self.plan),
        }
    }
}

impl From<LotPlan> for String {
    fn from(value: LotPlan) -> Self {
        value.to_string()
    }
}

impl FromStr for LotPlan {
    type Err = LotPlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Split pasted text (newline, comma or semicolon separated) into unique
/// identifiers, preserving first-seen order. Unparseable entries are returned
/// separately so callers can report them.
#[must_use]
pub fn parse_list(text: &str) -> (Vec<LotPlan>, Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    let mut parsed = Vec::new();
    let mut rejected = Vec::new();
    for raw in text.split(['\n', ',', ';']) {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match LotPlan::parse(raw) {
            Ok(lp) => {
                if seen.insert(lp.clone()) {
                    parsed.push(lp);
                }
            }
            Err(_) => rejected.push(raw.to_string()),
        }
    }
    (parsed, rejected)
}

fn is_lot(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_plan(s: &str) -> bool {
    let letters = s.chars().take_while(char::is_ascii_uppercase).count();
    letters > 0
        && s.len() > letters
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn strip_leading_zeros(s: &str) -> String {
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queensland_concatenated_form() {
        let lp = LotPlan::parse("13SP181800").unwrap();
        assert_eq!(lp.lot(), "13");
        assert_eq!(lp.plan(), "SP181800");
        assert_eq!(lp.to_string(), "13SP181800");
    }

    #[test]
    fn test_words_and_spacing_are_ignored() {
        assert_eq!(LotPlan::parse("Lot 13 on Plan SP181800").unwrap().to_string(), "13SP181800");
        assert_eq!(LotPlan::parse(" 1 rp 12345 ").unwrap().to_string(), "1RP12345");
    }

    #[test]
    fn test_section_uses_slash_form() {
        let lp = LotPlan::parse("Lot 2 Section 5 DP 12345").unwrap();
        assert_eq!(lp.section(), Some("5"));
        assert_eq!(lp.to_string(), "2/5/DP12345");
        assert_eq!(LotPlan::parse("Lot 2 Sec 5 DP 12345").unwrap(), lp);
    }

    #[test]
    fn test_deposited_plan_without_section() {
        assert_eq!(LotPlan::parse("lot 3 dp 45678").unwrap().to_string(), "3/DP45678");
    }

    #[test]
    fn test_normalized_forms_reparse_to_themselves() {
        for s in ["13SP181800", "3/DP45678", "2/5/DP12345"] {
            assert_eq!(LotPlan::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(LotPlan::parse("   "), Err(LotPlanError::Empty));
        assert!(LotPlan::parse("SP181800").is_err());
        assert!(LotPlan::parse("12345").is_err());
        assert!(LotPlan::parse("hello world").is_err());
    }

    #[test]
    fn test_parse_list_dedupes_and_reports() {
        let (parsed, rejected) = parse_list("13SP181800\n1RP12345; lot 13 plan sp181800, nonsense");
        let names: Vec<String> = parsed.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["13SP181800", "1RP12345"]);
        assert_eq!(rejected, vec!["nonsense"]);
    }
}

//! Validation System - template frame contracts
//!
//! Rules produce structured violations; the registry turns them into errors.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::FrameSpec;
use crate::scene::{Document, Node, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl fmt::Display for ValidationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub struct FrameSizeRule<'a> {
    pub spec: &'a FrameSpec,
    pub tolerance: u32,
}

impl FrameSizeRule<'_> {
    pub fn name(&self) -> &'static str {
        "frame_size"
    }

    /// Measured size is rounded to whole units before comparing.
    pub fn check(&self, frame: &Node) -> Option<ValidationViolation> {
        let actual_width = frame.width.round() as i64;
        let actual_height = frame.height.round() as i64;
        let expected_width = i64::from(self.spec.width);
        let expected_height = i64::from(self.spec.height);
        let tolerance = i64::from(self.tolerance);

        if (actual_width - expected_width).abs() <= tolerance
            && (actual_height - expected_height).abs() <= tolerance
        {
            return None;
        }

        let remediation = format!(
            "Please resize your frame to exactly {}×{}px for correct {} export at 300 DPI.",
            expected_width, expected_height, self.spec.name
        );
        Some(ValidationViolation {
            rule: self.name().to_string(),
            message: format!(
                "Frame size mismatch!\n\n\
                 Expected: {}×{}px ({} at 100 DPI)\n\
                 Actual: {}×{}px\n\n{}",
                expected_width,
                expected_height,
                self.spec.physical,
                actual_width,
                actual_height,
                remediation
            ),
            expected: Some(format!("{}×{}px", expected_width, expected_height)),
            actual: Some(format!("{}×{}px", actual_width, actual_height)),
            remediation: vec![remediation],
        })
    }
}

pub struct PlaceholderRule<'a> {
    /// Literal token, e.g. `{poster_copy}`.
    pub token: &'a str,
    /// Human label used in the message, e.g. `Poster`.
    pub label: &'a str,
}

impl PlaceholderRule<'_> {
    pub fn name(&self) -> &'static str {
        "placeholder"
    }

    /// Every text node under `root` (depth-first) whose characters contain the token.
    pub fn find_layers(&self, document: &Document, root: &str) -> Vec<NodeId> {
        let mut found = vec![];
        document.walk(root, &mut |node| {
            if node.characters().is_some_and(|text| text.contains(self.token)) {
                found.push(node.id.clone());
            }
        });
        found
    }

    pub fn check(
        &self,
        document: &Document,
        root: &str,
    ) -> Result<Vec<NodeId>, ValidationViolation> {
        let layers = self.find_layers(document, root);
        if layers.is_empty() {
            return Err(ValidationViolation {
                rule: self.name().to_string(),
                message: format!(
                    "{} template must contain {} placeholder",
                    self.label, self.token
                ),
                expected: Some(self.token.to_string()),
                actual: None,
                remediation: vec![format!("Add a text layer containing {}", self.token)],
            });
        }
        Ok(layers)
    }
}

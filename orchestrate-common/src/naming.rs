//! Resource naming helpers shared by instance creation and template-size expansion.
//!
//! Patterns use `{token}` placeholders. Supported tokens:
//! `type`, `template`, `size`, `region`, `zone`, `project`, `gpu_count`, `gpu_type`, `user`.
//! `type` and `template` are aliases for the Template name.

use crate::{OrchestrateError, Result};

/// Longest name the provider accepts for instances and instance-templates.
pub const MAX_RESOURCE_NAME_LEN: usize = 63;

pub const KNOWN_TOKENS: &[&str] = &[
    "type",
    "template",
    "size",
    "region",
    "zone",
    "project",
    "gpu_count",
    "gpu_type",
    "user",
];

/// Values available to a naming pattern. `None` means the token cannot be resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingContext {
    pub template: Option<String>,
    pub size: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub project: Option<String>,
    pub gpu_count: Option<i32>,
    pub gpu_type: Option<String>,
    pub user: Option<String>,
}

impl NamingContext {
    fn lookup(&self, token: &str) -> Option<String> {
        let value = match token {
            "type" | "template" => self.template.clone(),
            "size" => self.size.clone(),
            "region" => self.region.clone(),
            "zone" => self.zone.clone(),
            "project" => self.project.clone(),
            "gpu_count" => self.gpu_count.map(|c| c.to_string()),
            "gpu_type" => self.gpu_type.clone(),
            "user" => self.user.clone(),
            _ => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// Substitute every `{token}` in `pattern` from `context`.
///
/// - Fails with `Pattern` naming the first token that is unknown or has no value
/// - An unterminated `{` fails with `Pattern` carrying the dangling text
/// - Never returns a partially substituted name
pub fn resolve(pattern: &str, context: &NamingContext) -> Result<String> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return Err(OrchestrateError::Pattern {
                token: after.to_string(),
            });
        };
        let token = after[..close].trim();
        match context.lookup(token) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(OrchestrateError::Pattern {
                    token: token.to_string(),
                })
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Lists the tokens a pattern references, in order of appearance.
pub fn pattern_tokens(pattern: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        tokens.push(after[..close].trim().to_string());
        rest = &after[close + 1..];
    }
    tokens
}

/// `us-central1-a` -> `us-central1`. A zone without a suffix is returned unchanged.
pub fn region_of_zone(zone: &str) -> String {
    match zone.rsplit_once('-') {
        Some((region, suffix)) if suffix.len() == 1 && !region.is_empty() => region.to_string(),
        _ => zone.to_string(),
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, squeeze and trim dashes.
pub fn normalize_resource_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

/// Checks a name against the provider's resource-name rules.
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(OrchestrateError::validation("resource name is empty"));
    }
    if name.len() > MAX_RESOURCE_NAME_LEN {
        return Err(OrchestrateError::validation(format!(
            "resource name '{}' exceeds {} characters",
            name, MAX_RESOURCE_NAME_LEN
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return Err(OrchestrateError::validation(format!(
            "resource name '{}' must start with a lowercase letter",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(OrchestrateError::validation(format!(
            "resource name '{}' may only contain lowercase letters, digits and '-'",
            name
        )));
    }
    Ok(())
}

/// Deterministic provider instance-template name for one Size of a Template.
pub fn instance_template_name(template: &str, size: &str) -> Result<String> {
    let name = normalize_resource_name(&format!("{}-{}", template, size));
    validate_resource_name(&name)?;
    Ok(name)
}

/// Name of the throwaway instance an image is built on.
pub fn build_instance_name(image: &str) -> String {
    let name = normalize_resource_name(&format!("orchestrate-build-{}", image));
    name.chars()
        .take(MAX_RESOURCE_NAME_LEN)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

//! Validation System - Coordinate Rules MK.01-MK.08
//!
//! Rules are pure and produce structured violations. The validator runs
//! every rule and aggregates; only an unparseable string fails fast.
//! Rules that need existing records consult a `RecordLookup` and are
//! skipped when none is supplied.

use serde::{Deserialize, Serialize};

use crate::config::ValidationLimits;
use crate::coordinate::{
    parse_ref_target, Coordinate, Directive, DIRECTIVE_PREFIX, REF_DIRECTIVE, REF_SEPARATOR,
};
use crate::error::Result;
use crate::schema::State;
use crate::tenant::TenantId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

impl ValidationViolation {
    fn new(rule: &dyn ValidationRule, message: impl Into<String>) -> Self {
        Self {
            rule: rule.id().to_string(),
            message: message.into(),
            expected: None,
            actual: None,
            remediation: vec![],
        }
    }

    fn expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    fn actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    fn remedy(mut self, remediation: impl Into<String>) -> Self {
        self.remediation.push(remediation.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub coordinate: String,
    pub violations: Vec<ValidationViolation>,
}

impl ValidationResult {
    pub fn success(coordinate: &Coordinate) -> Self {
        Self {
            valid: true,
            coordinate: coordinate.to_string(),
            violations: vec![],
        }
    }

    pub fn failure(coordinate: &Coordinate, violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: false,
            coordinate: coordinate.to_string(),
            violations,
        }
    }

    /// Rule ids in the order they were violated.
    pub fn violated_rules(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.rule.as_str()).collect()
    }

    pub fn has_violation(&self, rule: &str) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }

    pub fn summary(&self) -> String {
        if self.violations.is_empty() {
            return "no violations".to_string();
        }
        self.violations
            .iter()
            .map(|v| format!("{}: {}", v.rule, v.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// What an existing record looks like to the context rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Live,
    Tombstoned,
}

/// Read-only view of existing records, scoped by tenant.
pub trait RecordLookup {
    fn status(&self, tenant: &TenantId, coordinate: &Coordinate) -> Option<RecordStatus>;
}

impl<F> RecordLookup for F
where
    F: Fn(&TenantId, &Coordinate) -> Option<RecordStatus>,
{
    fn status(&self, tenant: &TenantId, coordinate: &Coordinate) -> Option<RecordStatus> {
        self(tenant, coordinate)
    }
}

#[derive(Clone, Copy)]
pub struct ValidationContext<'a> {
    pub tenant: &'a TenantId,
    pub lookup: Option<&'a dyn RecordLookup>,
}

impl<'a> ValidationContext<'a> {
    /// Context without record access; MK.04, MK.06 and MK.07's existence
    /// checks do not apply.
    pub fn detached(tenant: &'a TenantId) -> Self {
        Self { tenant, lookup: None }
    }

    pub fn with_lookup(tenant: &'a TenantId, lookup: &'a dyn RecordLookup) -> Self {
        Self {
            tenant,
            lookup: Some(lookup),
        }
    }

    fn status(&self, coordinate: &Coordinate) -> Option<Option<RecordStatus>> {
        self.lookup.map(|l| l.status(self.tenant, coordinate))
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn validate(&self, coordinate: &Coordinate, ctx: &ValidationContext<'_>) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct StructuralRule {
    max_len: usize,
}

impl ValidationRule for StructuralRule {
    fn id(&self) -> &'static str { "MK.01" }
    fn name(&self) -> &'static str { "structural_completeness" }

    fn validate(&self, coordinate: &Coordinate, _ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        // Segment count and vocabulary membership are enforced by parsing;
        // what remains is the overall size.
        let len = coordinate.as_str().len();
        if len <= self.max_len {
            return vec![];
        }
        vec![ValidationViolation::new(self, "Coordinate too long")
            .expected(format!("at most {} bytes", self.max_len))
            .actual(format!("{} bytes", len))
            .remedy("Shorten or drop qualifier segments")]
    }
}

pub struct CategoryDomainRule;

impl ValidationRule for CategoryDomainRule {
    fn id(&self) -> &'static str { "MK.02" }
    fn name(&self) -> &'static str { "category_domain_compatibility" }

    fn validate(&self, coordinate: &Coordinate, _ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        let category = coordinate.category();
        let domain = coordinate.domain();
        if category.allows(domain) {
            return vec![];
        }

        let allowed: Vec<_> = category.domains().iter().map(|d| d.as_str()).collect();
        vec![ValidationViolation::new(self, format!("Domain {} is not legal under {}", domain, category))
            .expected(allowed.join(" | "))
            .actual(domain.to_string())
            .remedy(format!("Use one of the {} domains", category))]
    }
}

pub struct AttributeApplicabilityRule;

impl ValidationRule for AttributeApplicabilityRule {
    fn id(&self) -> &'static str { "MK.03" }
    fn name(&self) -> &'static str { "attribute_applicability" }

    fn validate(&self, coordinate: &Coordinate, _ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        let domain = coordinate.domain();
        let attribute = coordinate.attribute();
        if domain.allows(attribute) {
            return vec![];
        }

        let allowed: Vec<_> = domain.attributes().iter().map(|a| a.as_str()).collect();
        vec![ValidationViolation::new(self, format!("Attribute {} does not apply to {}", attribute, domain))
            .expected(allowed.join(" | "))
            .actual(attribute.to_string())]
    }
}

pub struct StateTransitionRule;

impl ValidationRule for StateTransitionRule {
    fn id(&self) -> &'static str { "MK.04" }
    fn name(&self) -> &'static str { "state_transition" }

    fn validate(&self, coordinate: &Coordinate, ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        let state = coordinate.state();
        let Some(predecessor) = state.required_predecessor() else {
            return vec![];
        };
        if coordinate.is_import() {
            return vec![];
        }

        let required = coordinate.with_state(predecessor);
        match ctx.status(&required) {
            None | Some(Some(_)) => vec![],
            Some(None) => vec![ValidationViolation::new(
                self,
                format!("{} requires a prior {} record for this address", state, predecessor),
            )
            .expected(required.to_string())
            .actual("no record".to_string())
            .remedy(format!("Create {} first", required))
            .remedy("Or mark the coordinate with an @import qualifier")],
        }
    }
}

/// Characters never allowed inside a qualifier segment.
const RESERVED_CHARS: &[char] = &['/', '\\', '*', '?', '#', '%', DIRECTIVE_PREFIX];

/// First reserved character in a qualifier segment. A directive's leading
/// '@' is its marker, not content; inside a `@ref:` target every
/// `:`-separated part may start with one, since the parent's own tail can
/// carry directives.
fn reserved_char(segment: &str) -> Option<char> {
    let scan = |part: &str| {
        part.strip_prefix(DIRECTIVE_PREFIX)
            .unwrap_or(part)
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || RESERVED_CHARS.contains(c))
    };
    match segment.strip_prefix(REF_DIRECTIVE) {
        Some(target) => target.split(REF_SEPARATOR).find_map(scan),
        None => scan(segment),
    }
}

pub struct TailWellFormedRule {
    limits: ValidationLimits,
}

impl ValidationRule for TailWellFormedRule {
    fn id(&self) -> &'static str { "MK.05" }
    fn name(&self) -> &'static str { "qualifier_well_formed" }

    fn validate(&self, coordinate: &Coordinate, _ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let tail = coordinate.tail();

        if tail.len() > self.limits.max_tail_segments {
            violations.push(
                ValidationViolation::new(self, "Too many qualifier segments")
                    .expected(format!("at most {}", self.limits.max_tail_segments))
                    .actual(tail.len().to_string()),
            );
        }

        for (i, segment) in tail.iter().enumerate() {
            if segment.is_empty() {
                violations.push(
                    ValidationViolation::new(self, format!("Qualifier segment {} is empty", i))
                        .remedy("Remove doubled or trailing separators"),
                );
                continue;
            }

            if segment.len() > self.limits.max_segment_len {
                violations.push(
                    ValidationViolation::new(self, format!("Qualifier segment {} is too long", i))
                        .expected(format!("at most {} bytes", self.limits.max_segment_len))
                        .actual(format!("{} bytes", segment.len())),
                );
            }

            if let Some(bad) = reserved_char(segment) {
                violations.push(
                    ValidationViolation::new(self, format!("Qualifier segment {} contains a reserved character", i))
                        .actual(format!("{:?} in '{}'", bad, segment)),
                );
            }
        }

        violations
    }
}

pub struct UniquenessRule;

impl ValidationRule for UniquenessRule {
    fn id(&self) -> &'static str { "MK.06" }
    fn name(&self) -> &'static str { "tenant_uniqueness" }

    fn validate(&self, coordinate: &Coordinate, ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        if ctx.status(coordinate) == Some(Some(RecordStatus::Live)) {
            vec![ValidationViolation::new(self, "A live record already uses this coordinate")
                .actual(coordinate.to_string())
                .remedy("Tombstone the existing record first")
                .remedy("Or advance the state to create a new version")]
        } else {
            vec![]
        }
    }
}

pub struct CrossReferenceRule;

impl ValidationRule for CrossReferenceRule {
    fn id(&self) -> &'static str { "MK.07" }
    fn name(&self) -> &'static str { "cross_reference_integrity" }

    fn validate(&self, coordinate: &Coordinate, ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        // Unparseable targets are MK.08's concern.
        let Some(Ok(parent)) = coordinate.parent_ref() else {
            return vec![];
        };
        let mut violations = vec![];

        if parent.state() == State::Archived {
            violations.push(
                ValidationViolation::new(self, "Referenced parent is archived")
                    .actual(parent.to_string()),
            );
        }

        match ctx.status(&parent) {
            None | Some(Some(RecordStatus::Live)) => {}
            Some(Some(RecordStatus::Tombstoned)) => violations.push(
                ValidationViolation::new(self, "Referenced parent has been deleted")
                    .actual(parent.to_string()),
            ),
            Some(None) => violations.push(
                ValidationViolation::new(self, "Referenced parent does not exist")
                    .actual(parent.to_string())
                    .remedy("Store the parent before the derived asset"),
            ),
        }

        if parent.state() != State::Archived
            && ctx.status(&parent.with_state(State::Archived)) == Some(Some(RecordStatus::Live))
        {
            violations.push(
                ValidationViolation::new(self, "Referenced parent has since been archived")
                    .actual(parent.with_state(State::Archived).to_string()),
            );
        }

        violations
    }
}

pub struct DirectiveRule;

impl ValidationRule for DirectiveRule {
    fn id(&self) -> &'static str { "MK.08" }
    fn name(&self) -> &'static str { "directive_well_formed" }

    fn validate(&self, coordinate: &Coordinate, _ctx: &ValidationContext<'_>) -> Vec<ValidationViolation> {
        let mut violations = vec![];
        let mut refs = 0;

        for directive in coordinate.directives() {
            match directive {
                Directive::Import => {}
                Directive::Ref(target) => {
                    refs += 1;
                    if let Err(e) = parse_ref_target(target) {
                        violations.push(
                            ValidationViolation::new(self, "Reference target is not a coordinate")
                                .actual(e.to_string())
                                .remedy("Write references as @ref:Category:Domain:Attribute:State"),
                        );
                    }
                }
                Directive::Unknown(raw) => violations.push(
                    ValidationViolation::new(self, "Unknown directive")
                        .expected("@import | @ref:<coordinate>")
                        .actual(raw.to_string()),
                ),
            }
        }

        if refs > 1 {
            violations.push(
                ValidationViolation::new(self, "More than one parent reference")
                    .expected("at most 1")
                    .actual(refs.to_string()),
            );
        }

        violations
    }
}

/// Validator runs the fixed, ordered rule list
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self::with_limits(ValidationLimits::default())
    }

    pub fn with_limits(limits: ValidationLimits) -> Self {
        Self {
            rules: vec![
                Box::new(StructuralRule { max_len: limits.max_coordinate_len }),
                Box::new(CategoryDomainRule),
                Box::new(AttributeApplicabilityRule),
                Box::new(StateTransitionRule),
                Box::new(TailWellFormedRule { limits }),
                Box::new(UniquenessRule),
                Box::new(CrossReferenceRule),
                Box::new(DirectiveRule),
            ],
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.rules.iter().map(|r| (r.id(), r.name()))
    }

    pub fn validate(&self, coordinate: &Coordinate, ctx: &ValidationContext<'_>) -> ValidationResult {
        let mut all_violations = vec![];

        for rule in &self.rules {
            all_violations.extend(rule.validate(coordinate, ctx));
        }

        if all_violations.is_empty() {
            ValidationResult::success(coordinate)
        } else {
            ValidationResult::failure(coordinate, all_violations)
        }
    }

    /// Parse then validate. Fails fast only when `text` does not parse.
    pub fn validate_str(&self, text: &str, ctx: &ValidationContext<'_>) -> Result<ValidationResult> {
        let coordinate = Coordinate::parse(text)?;
        Ok(self.validate(&coordinate, ctx))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use std::collections::HashMap;

    fn coord(s: &str) -> Coordinate {
        Coordinate::parse(s).unwrap()
    }

    fn lookup_from(entries: &[(&str, RecordStatus)]) -> impl Fn(&TenantId, &Coordinate) -> Option<RecordStatus> {
        let map: HashMap<String, RecordStatus> =
            entries.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        move |_t: &TenantId, c: &Coordinate| map.get(c.as_str()).copied()
    }

    #[test]
    fn test_valid_draft_passes() {
        let tenant = TenantId::new();
        let lookup = lookup_from(&[]);
        let ctx = ValidationContext::with_lookup(&tenant, &lookup);
        let result = Validator::new().validate(&coord("Music.Vocal.Pitch.Draft"), &ctx);
        assert!(result.valid, "{}", result.summary());
    }

    #[test]
    fn test_validate_str_fails_fast_on_parse() {
        let tenant = TenantId::new();
        let err = Validator::new()
            .validate_str("Music.Vocal", &ValidationContext::detached(&tenant))
            .unwrap_err();
        assert!(matches!(err, CoreError::MalformedCoordinate { .. }));
    }

    #[test]
    fn test_accumulates_every_violation() {
        let tenant = TenantId::new();
        let ctx = ValidationContext::detached(&tenant);
        // Vocal is illegal under Image, ColorGrade illegal for Vocal, empty tail, unknown directive.
        let result = Validator::new().validate(&coord("Image.Vocal.ColorGrade.Draft..@nope"), &ctx);
        assert!(!result.valid);
        assert_eq!(result.violated_rules(), vec!["MK.02", "MK.03", "MK.05", "MK.08"]);
    }

    #[test]
    fn test_published_requires_validated_predecessor() {
        let tenant = TenantId::new();
        let empty = lookup_from(&[]);
        let ctx = ValidationContext::with_lookup(&tenant, &empty);
        let result = Validator::new().validate(&coord("Music.Vocal.Pitch.Published"), &ctx);
        assert!(result.has_violation("MK.04"));

        let with_prior = lookup_from(&[("Music.Vocal.Pitch.Validated", RecordStatus::Tombstoned)]);
        let ctx = ValidationContext::with_lookup(&tenant, &with_prior);
        let result = Validator::new().validate(&coord("Music.Vocal.Pitch.Published"), &ctx);
        assert!(result.valid, "{}", result.summary());
    }

    #[test]
    fn test_import_directive_exempts_state_rule() {
        let tenant = TenantId::new();
        let empty = lookup_from(&[]);
        let ctx = ValidationContext::with_lookup(&tenant, &empty);
        let result = Validator::new().validate(&coord("Music.Vocal.Pitch.Archived.@import"), &ctx);
        assert!(result.valid, "{}", result.summary());
    }

    #[test]
    fn test_context_rules_skipped_without_lookup() {
        let tenant = TenantId::new();
        let ctx = ValidationContext::detached(&tenant);
        let result = Validator::new().validate(&coord("Music.Vocal.Pitch.Published"), &ctx);
        assert!(result.valid);
    }

    #[test]
    fn test_uniqueness_only_counts_live_records() {
        let tenant = TenantId::new();
        let live = lookup_from(&[("Video.Edit.Cut.Draft", RecordStatus::Live)]);
        let result = Validator::new().validate(
            &coord("Video.Edit.Cut.Draft"),
            &ValidationContext::with_lookup(&tenant, &live),
        );
        assert_eq!(result.violated_rules(), vec!["MK.06"]);

        let dead = lookup_from(&[("Video.Edit.Cut.Draft", RecordStatus::Tombstoned)]);
        let result = Validator::new().validate(
            &coord("Video.Edit.Cut.Draft"),
            &ValidationContext::with_lookup(&tenant, &dead),
        );
        assert!(result.valid);
    }

    #[test]
    fn test_cross_reference_integrity() {
        let tenant = TenantId::new();
        let remix = coord("Music.Vocal.Pitch.Draft.remix.@ref:Music:Vocal:Pitch:Validated");

        let missing = lookup_from(&[]);
        let result = Validator::new().validate(&remix, &ValidationContext::with_lookup(&tenant, &missing));
        assert_eq!(result.violated_rules(), vec!["MK.07"]);

        let present = lookup_from(&[("Music.Vocal.Pitch.Validated", RecordStatus::Live)]);
        let result = Validator::new().validate(&remix, &ValidationContext::with_lookup(&tenant, &present));
        assert!(result.valid, "{}", result.summary());

        let archived = lookup_from(&[
            ("Music.Vocal.Pitch.Validated", RecordStatus::Live),
            ("Music.Vocal.Pitch.Archived", RecordStatus::Live),
        ]);
        let result = Validator::new().validate(&remix, &ValidationContext::with_lookup(&tenant, &archived));
        assert_eq!(result.violated_rules(), vec!["MK.07"]);
    }

    #[test]
    fn test_directive_rules() {
        let tenant = TenantId::new();
        let ctx = ValidationContext::detached(&tenant);
        let result = Validator::new().validate(
            &coord("Music.Vocal.Pitch.Draft.@ref:Music:Vocal.@ref:Music:Vocal:Pitch:Draft"),
            &ctx,
        );
        let mk08: Vec<_> = result.violations.iter().filter(|v| v.rule == "MK.08").collect();
        assert_eq!(mk08.len(), 2);
    }

    #[test]
    fn test_tail_limits() {
        let tenant = TenantId::new();
        let ctx = ValidationContext::detached(&tenant);
        let validator = Validator::with_limits(ValidationLimits {
            max_tail_segments: 2,
            max_segment_len: 4,
            max_coordinate_len: 256,
        });
        let result = validator.validate(&coord("Music.Vocal.Pitch.Draft.a.b.toolong"), &ctx);
        let messages: Vec<_> = result.violations.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["Too many qualifier segments", "Qualifier segment 2 is too long"]
        );

        let result = validator.validate(&coord("Music.Vocal.Pitch.Draft.a b"), &ctx);
        assert!(result.has_violation("MK.05"));
    }

    #[test]
    fn test_archived_requires_published_predecessor() {
        let tenant = TenantId::new();
        let only_validated = lookup_from(&[("Video.Edit.Cut.Validated", RecordStatus::Live)]);
        let ctx = ValidationContext::with_lookup(&tenant, &only_validated);
        let result = Validator::new().validate(&coord("Video.Edit.Cut.Archived"), &ctx);
        assert_eq!(result.violated_rules(), vec!["MK.04"]);
        assert_eq!(result.violations[0].expected.as_deref(), Some("Video.Edit.Cut.Published"));

        let published = lookup_from(&[("Video.Edit.Cut.Published", RecordStatus::Live)]);
        let ctx = ValidationContext::with_lookup(&tenant, &published);
        let result = Validator::new().validate(&coord("Video.Edit.Cut.Archived"), &ctx);
        assert!(result.valid, "{}", result.summary());

        let result = Validator::new().validate(&coord("Video.Edit.Cut.Archived.@import"), &ctx);
        assert!(result.valid, "{}", result.summary());
    }

    #[test]
    fn test_ref_target_may_carry_directives() {
        let tenant = TenantId::new();
        let parent = lookup_from(&[("Music.Vocal.Pitch.Validated.@import", RecordStatus::Live)]);
        let ctx = ValidationContext::with_lookup(&tenant, &parent);
        let result = Validator::new().validate(
            &coord("Music.Vocal.Harmony.Draft.@ref:Music:Vocal:Pitch:Validated:@import"),
            &ctx,
        );
        assert!(result.valid, "{}", result.summary());

        let result = Validator::new().validate(
            &coord("Music.Vocal.Harmony.Draft.@ref:Music:Vocal:Pitch:Validated:a@b"),
            &ctx,
        );
        assert!(result.has_violation("MK.05"));
    }

    #[test]
    fn test_structural_length_limit() {
        let tenant = TenantId::new();
        let ctx = ValidationContext::detached(&tenant);
        let validator = Validator::with_limits(ValidationLimits {
            max_coordinate_len: 10,
            ..ValidationLimits::default()
        });
        let result = validator.validate(&coord("Music.Vocal.Pitch.Draft"), &ctx);
        assert_eq!(result.violated_rules(), vec!["MK.01"]);
        assert_eq!(result.violations[0].actual.as_deref(), Some("23 bytes"));

        let roomy = Validator::with_limits(ValidationLimits {
            max_coordinate_len: 23,
            ..ValidationLimits::default()
        });
        assert!(roomy.validate(&coord("Music.Vocal.Pitch.Draft"), &ctx).valid);
    }

    #[test]
    fn test_rule_order_is_fixed() {
        let ids: Vec<_> = Validator::new().rules().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["MK.01", "MK.02", "MK.03", "MK.04", "MK.05", "MK.06", "MK.07", "MK.08"]);
    }
}

//! Discriminator dispatch: choosing the case of a type switch.
//!
//! Cases are tried in declaration order and the first whose tuple matches wins. A wildcard
//! entry matches any observed value; an empty tuple is the default case.

use crate::error::CodecError;
use crate::model::{Case, CaseValue, Field, SwitchField};
use crate::value::Value;
use tracing::{debug, trace};

/// Whether `case` accepts the observed discriminator values.
pub fn case_matches(case: &Case, observed: &[Value]) -> bool {
    if case.is_default() {
        return true;
    }
    case.discriminator_values.len() == observed.len()
        && case
            .discriminator_values
            .iter()
            .zip(observed)
            .all(|(expected, actual)| match expected {
                CaseValue::Any => true,
                CaseValue::Value(lit) => actual.matches_literal(lit),
            })
}

/// First matching case and its index, or `UnknownDiscriminator`.
pub fn select_case<'s>(switch: &'s SwitchField, observed: &[Value]) -> Result<(usize, &'s Case), CodecError> {
    match switch.cases.iter().enumerate().find(|(_, c)| case_matches(c, observed)) {
        Some((index, case)) => {
            trace!(case = %case.name, index, "selected case");
            Ok((index, case))
        }
        None => {
            let values: Vec<String> = observed.iter().map(|v| v.to_string()).collect();
            debug!(
                discriminators = ?switch.discriminators,
                values = ?values,
                "no case matches"
            );
            Err(CodecError::UnknownDiscriminator {
                fields: switch.discriminators.clone(),
                values,
            })
        }
    }
}

/// Case by name, for writers that already know the concrete type.
pub fn case_by_name<'s>(switch: &'s SwitchField, name: &str) -> Option<(usize, &'s Case)> {
    switch.cases.iter().enumerate().find(|(_, c)| c.name == name)
}

/// Cases leading to `name` through nested switches, outermost first. The last entry is the
/// named case itself.
pub fn case_path<'s>(switch: &'s SwitchField, name: &str) -> Option<Vec<(&'s SwitchField, &'s Case)>> {
    switch.cases.iter().find_map(|case| {
        if case.name == name {
            return Some(vec![(switch, case)]);
        }
        let mut path = case.fields.iter().find_map(|f| match f {
            Field::Switch(inner) => case_path(inner, name),
            _ => None,
        })?;
        path.insert(0, (switch, case));
        Some(path)
    })
}

/// The case's tuple as values; `None` entries are wildcards (or the whole tuple for a default).
pub fn discriminator_tuple(switch: &SwitchField, case: &Case) -> Vec<Option<Value>> {
    if case.is_default() {
        return vec![None; switch.discriminators.len()];
    }
    case.discriminator_values
        .iter()
        .map(|v| match v {
            CaseValue::Value(lit) => Some(lit.to_value()),
            CaseValue::Any => None,
        })
        .collect()
}

/// Discriminator field values an encoder must emit to select `case`. Wildcard positions are
/// left out; the caller must supply those.
pub fn derive_discriminators(switch: &SwitchField, case: &Case) -> Vec<(String, Value)> {
    switch
        .discriminators
        .iter()
        .zip(discriminator_tuple(switch, case))
        .filter_map(|(name, value)| value.map(|v| (name.clone(), v)))
        .collect()
}

/// Two tuples that select exactly the same inputs (same literal at every position).
pub(crate) fn same_tuple(a: &[CaseValue], b: &[CaseValue]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (CaseValue::Any, CaseValue::Any) => true,
            (CaseValue::Value(x), CaseValue::Value(y)) => x.same_as(y),
            _ => false,
        })
}

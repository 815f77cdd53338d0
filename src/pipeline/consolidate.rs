//! Folds per-option answers of group variables back into one value.

use std::collections::HashMap;

use super::types::{FieldMap, VariableKind, VariableSpec, NOT_PROVIDED, YES};

/// Final value for every schema variable, in schema order.
///
/// Text variables take their answer directly. A group variable resolves to
/// its single checked option; none checked gives `NOT_PROVIDED`; several
/// checked gives the comma-joined labels plus a conflict warning. Lookups
/// ignore case.
pub fn consolidate(
    answers: &FieldMap,
    variables: &[VariableSpec],
    warnings: &mut Vec<String>,
) -> FieldMap {
    let lowered: HashMap<String, &str> = answers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    let lookup = |key: &str| lowered.get(&key.to_lowercase()).copied();

    let mut result = FieldMap::new();
    for var in variables {
        let value = match var.kind {
            VariableKind::Text => lookup(&var.name).unwrap_or(NOT_PROVIDED).to_string(),
            VariableKind::Group => {
                let checked: Vec<&str> = var
                    .options
                    .iter()
                    .filter(|opt| {
                        lookup(&var.option_key(opt))
                            .is_some_and(|v| v.trim().eq_ignore_ascii_case(YES))
                    })
                    .map(String::as_str)
                    .collect();

                match checked.as_slice() {
                    [] => NOT_PROVIDED.to_string(),
                    [single] => single.to_string(),
                    many => {
                        let joined = many.join(", ");
                        tracing::warn!(variable = %var.name, options = %joined, "Group conflict");
                        warnings.push(format!(
                            "Conflict for '{}': multiple options checked ({joined})",
                            var.name
                        ));
                        joined
                    }
                }
            }
        };
        result.insert(var.name.clone(), value);
    }
    result
}

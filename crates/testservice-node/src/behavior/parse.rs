//! Chain parser: splits a behavior string into service-scoped items and
//! hands each `key=value` directive to the registry.

use crate::error::BehaviorError;

use super::{global_registry, BehaviorChain, Registry, ServiceBehavior};

/// Classify a comma-delimited token. A token is a service prefix when a
/// `:` appears before any `=` (or the token has no `=` at all); otherwise
/// it continues the previous item's directive list.
fn split_service_prefix(token: &str) -> Option<(&str, &str)> {
    match (token.find(':'), token.find('=')) {
        (Some(colon), Some(eq)) if colon < eq => Some((&token[..colon], &token[colon + 1..])),
        (Some(colon), None) => Some((&token[..colon], &token[colon + 1..])),
        _ => None,
    }
}

fn apply_directive(
    registry: &Registry,
    item: &mut ServiceBehavior,
    token: &str,
) -> Result<(), BehaviorError> {
    let (key, value) = token
        .split_once('=')
        .ok_or_else(|| BehaviorError::MissingValue(token.to_string()))?;
    registry.apply(&mut item.behavior, key.trim(), value.trim())
}

/// Parse a full behavior chain with an explicit registry.
pub fn parse_chain_with(registry: &Registry, s: &str) -> Result<BehaviorChain, BehaviorError> {
    let mut entries: Vec<ServiceBehavior> = Vec::new();
    let mut current: Option<ServiceBehavior> = None;

    for raw in s.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((service, rest)) = split_service_prefix(token) {
            if let Some(item) = current.take() {
                entries.push(item);
            }
            let mut item = ServiceBehavior::new(service.trim());
            let rest = rest.trim();
            if !rest.is_empty() {
                apply_directive(registry, &mut item, rest)?;
            }
            current = Some(item);
        } else {
            let item = current.get_or_insert_with(|| ServiceBehavior::new(""));
            apply_directive(registry, item, token)?;
        }
    }
    if let Some(item) = current.take() {
        entries.push(item);
    }
    entries.retain(|e| !e.behavior.is_empty());
    Ok(BehaviorChain::from_entries(entries))
}

/// Parse a full behavior chain against the process-wide registry.
pub fn parse_chain(s: &str) -> Result<BehaviorChain, BehaviorError> {
    parse_chain_with(global_registry(), s)
}

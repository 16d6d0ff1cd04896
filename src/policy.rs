//! Account grants in resource policies.
//!
//! Both the transit bucket policy and the poller key policy carry one
//! statement (found by `Sid`) whose `Principal.AWS` lists every transit
//! account. Granting an account appends its root principal there unless the
//! account id already appears.

use anyhow::{Context, Result, bail};
use serde_json::Value;

pub fn account_root_arn(account_id: &str) -> String {
    format!("arn:aws:iam::{}:root", account_id)
}

/// Add `account_id` to the principals of statement `sid`.
///
/// Returns `true` if the policy changed. Calling it again with the same
/// account leaves the document untouched.
pub fn grant_account(policy: &mut Value, sid: &str, account_id: &str) -> Result<bool> {
    let statements = policy
        .get_mut("Statement")
        .and_then(Value::as_array_mut)
        .context("Policy has no Statement list")?;
    let statement = statements
        .iter_mut()
        .find(|s| s.get("Sid").and_then(Value::as_str) == Some(sid))
        .with_context(|| format!("Policy has no statement with Sid '{}'", sid))?;

    let principal = statement
        .as_object_mut()
        .context("Statement is not an object")?
        .entry("Principal")
        .or_insert_with(|| Value::Object(Default::default()));
    let principal = match principal {
        Value::Object(map) => map,
        Value::String(s) if s.as_str() == "*" => return Ok(false),
        _ => bail!("Statement '{}' has an unsupported Principal", sid),
    };

    let aws = principal
        .entry("AWS")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Value::String(single) = aws {
        let single = std::mem::take(single);
        *aws = Value::Array(vec![Value::String(single)]);
    }
    let Value::Array(entries) = aws else {
        bail!("Statement '{}' has a malformed Principal.AWS", sid);
    };

    let present = entries
        .iter()
        .filter_map(Value::as_str)
        .any(|entry| entry.contains(account_id));
    if present {
        return Ok(false);
    }
    entries.push(Value::String(account_root_arn(account_id)));
    Ok(true)
}

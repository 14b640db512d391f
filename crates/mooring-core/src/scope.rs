//! Session scoping: multiplexing many logical sessions over one socket.
//!
//! Sibling sessions share a physical connection, so outgoing request ids
//! are rewritten to `"<serverId>_<id>"` before transmission and incoming
//! ids are matched against the scope prefix and restored. Traffic whose
//! id belongs to another scope is simply not for us and gets dropped by
//! the caller. The prefix/strip pair must stay a bijection for the life
//! of the scope, which is why scope ids are validated at registration:
//! an id containing the delimiter could collide with a sibling.

use crate::envelope::Envelope;
use crate::error::{MooringError, MooringResult};
use serde_json::Value;

/// Separator between the scope id and the original request id.
pub const SCOPE_DELIMITER: char = '_';

/// Reject scope ids that would break prefix matching.
pub fn validate_server_id(server_id: &str) -> MooringResult<()> {
    if server_id.is_empty() {
        return Err(MooringError::InvalidScopeId("empty".to_string()));
    }
    if server_id.contains(SCOPE_DELIMITER) {
        return Err(MooringError::InvalidScopeId(format!(
            "{server_id:?} contains the scope delimiter {SCOPE_DELIMITER:?}"
        )));
    }
    Ok(())
}

/// Rewrite a numeric outgoing `data.id` to its scoped string form.
///
/// Envelopes without a numeric id (notifications, already-scoped
/// traffic) pass through untouched.
pub fn scope_request_id(envelope: &mut Envelope, server_id: &str) {
    let Some(data) = envelope.data.as_mut().and_then(Value::as_object_mut) else {
        return;
    };
    let Some(id) = data.get("id").and_then(Value::as_u64) else {
        return;
    };
    data.insert(
        "id".to_string(),
        Value::String(format!("{server_id}{SCOPE_DELIMITER}{id}")),
    );
}

/// Restore a scoped incoming `data.id` to its original numeric form.
///
/// Returns `true` when the envelope belongs to this scope (id matched
/// and was restored); `false` means "not for me" and the envelope is
/// left untouched.
pub fn unscope_response_id(envelope: &mut Envelope, server_id: &str) -> bool {
    let Some(data) = envelope.data.as_mut().and_then(Value::as_object_mut) else {
        return false;
    };
    let prefix = format!("{server_id}{SCOPE_DELIMITER}");
    let restored = {
        let Some(id) = data.get("id").and_then(Value::as_str) else {
            return false;
        };
        let Some(rest) = id.strip_prefix(&prefix) else {
            return false;
        };
        match rest.parse::<u64>() {
            Ok(n) => n,
            Err(_) => return false,
        }
    };
    data.insert("id".to_string(), Value::from(restored));
    true
}

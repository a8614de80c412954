//! Message relay: unicast by target_device_id, broadcast otherwise.
//!
//! Inbound frames are JSON objects `{target_device_id?, payload}`. The
//! gateway stamps `sender_device_id` from the authenticated session (any
//! client-supplied value is overwritten) and forwards the object otherwise
//! untouched. Delivery is fire-and-forget: a failed send is swallowed and the
//! closure path unregisters the peer.

use crate::registry::{DeviceRegistry, Outbound, PairingWaiters, SessionHandle};
use phb_core::Role;
use serde_json::Value;
use tracing::{debug, info};

/// Rewrite an inbound frame for relay. Returns the optional unicast target
/// and the serialized outbound frame, or `None` when the frame is not a JSON
/// object with a well-formed target (dropped, the sender stays connected).
pub fn rewrite_envelope(sender_device_id: &str, raw: &str) -> Option<(Option<String>, String)> {
    let mut value: Value = serde_json::from_str(raw).ok()?;
    let obj = value.as_object_mut()?;

    let target = match obj.get("target_device_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(target)) => Some(target.clone()),
        Some(_) => return None,
    };

    obj.insert(
        "sender_device_id".to_string(),
        Value::String(sender_device_id.to_string()),
    );

    Some((target, value.to_string()))
}

/// Relay one frame from an authenticated session.
pub async fn dispatch(
    registry: &DeviceRegistry,
    pairing: &PairingWaiters,
    sender: &SessionHandle,
    raw: &str,
) {
    let Some((target, frame)) = rewrite_envelope(&sender.device_id, raw) else {
        debug!(from = %sender.device_id, "dropping malformed relay frame");
        return;
    };

    match target {
        Some(target_id) => {
            if let Some(peer) = registry.lookup(&target_id).await {
                if !peer.send(Outbound::Frame(frame)) {
                    debug!(from = %sender.device_id, target = %target_id, "send failed, peer closing");
                }
                return;
            }
            // A parked pairing socket is reachable only by the desktop's
            // verdict; it gets exactly one routed frame, then closes.
            if sender.role == Role::Desktop {
                if let Some(waiter) = pairing.take(&target_id).await {
                    let _ = waiter.send(Outbound::Frame(frame));
                    let _ = waiter.send(Outbound::Close(1000, "pairing complete"));
                    info!(target = %target_id, "pairing verdict delivered");
                    return;
                }
            }
            info!(from = %sender.device_id, target = %target_id, "target not connected, frame dropped");
        }
        None => {
            for peer in registry.broadcast_targets(&sender.session_id).await {
                if !peer.send(Outbound::Frame(frame.clone())) {
                    debug!(from = %sender.device_id, to = %peer.device_id, "broadcast send failed");
                }
            }
        }
    }
}

use ocpp_gateway::ocpp::OcppVersion;
use serde_json::{Value, json};
use uuid::Uuid;

/// Unique ids are UUIDs, exactly the 36 characters OCPP-J allows.
pub fn new_unique_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn call(unique_id: &str, action: &str, payload: Value) -> String {
    json!([2, unique_id, action, payload]).to_string()
}

pub fn call_result(unique_id: &str, payload: Value) -> String {
    json!([3, unique_id, payload]).to_string()
}

pub fn call_error(unique_id: &str, code: &str, description: &str) -> String {
    json!([4, unique_id, code, description, {}]).to_string()
}

pub fn boot_notification(version: OcppVersion, vendor: &str, model: &str) -> Value {
    match version {
        OcppVersion::V16 => json!({
            "chargePointVendor": vendor,
            "chargePointModel": model,
        }),
        OcppVersion::V20 | OcppVersion::V201 => json!({
            "reason": "PowerUp",
            "chargingStation": {
                "vendorName": vendor,
                "model": model,
            },
        }),
    }
}

/// Interval the central system asked for in its BootNotification reply.
pub fn heartbeat_interval(boot_result: &Value) -> Option<u64> {
    boot_result.get("interval").and_then(Value::as_u64).filter(|&secs| secs > 0)
}

/// Reply sent when the central system calls the charge point.
///
/// The simulator accepts configuration and control requests blindly and
/// rejects what it cannot fake.
pub fn reply_to_call(version: OcppVersion, unique_id: &str, action: &str) -> String {
    match action {
        "Reset" | "ChangeAvailability" | "ChangeConfiguration" | "SetVariables"
        | "TriggerMessage" | "UnlockConnector" | "ClearCache" | "RemoteStartTransaction"
        | "RemoteStopTransaction" | "RequestStartTransaction" | "RequestStopTransaction" => {
            call_result(unique_id, json!({ "status": "Accepted" }))
        }
        "GetConfiguration" if version == OcppVersion::V16 => {
            call_result(unique_id, json!({ "configurationKey": [] }))
        }
        "DataTransfer" => call_result(unique_id, json!({ "status": "UnknownVendorId" })),
        _ => call_error(unique_id, "NotImplemented", "action not supported by the simulator"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ocpp_gateway::ocpp::{Envelope, FrameCodec};

    #[test]
    fn test_frames_decode_with_gateway_codec() {
        let codec = FrameCodec::new(OcppVersion::V16);
        let id = new_unique_id();
        assert_eq!(id.len(), 36);

        let frame = call(&id, "BootNotification", boot_notification(OcppVersion::V16, "V", "M"));
        let decoded = codec.decode(Bytes::from(frame)).unwrap();
        assert_eq!(
            decoded.envelope,
            Envelope::Call {
                unique_id: id,
                action: "BootNotification".to_string()
            }
        );
    }

    #[test]
    fn test_boot_notification_shape_per_version() {
        let v16 = boot_notification(OcppVersion::V16, "Acme", "X1");
        assert_eq!(v16["chargePointVendor"], "Acme");

        let v201 = boot_notification(OcppVersion::V201, "Acme", "X1");
        assert_eq!(v201["reason"], "PowerUp");
        assert_eq!(v201["chargingStation"]["model"], "X1");
    }

    #[test]
    fn test_heartbeat_interval() {
        assert_eq!(heartbeat_interval(&json!({"status":"Accepted","interval":300})), Some(300));
        assert_eq!(heartbeat_interval(&json!({"interval":0})), None);
        assert_eq!(heartbeat_interval(&json!({})), None);
    }

    #[test]
    fn test_unknown_call_gets_error_with_version_vocabulary() {
        let codec = FrameCodec::new(OcppVersion::V201);
        let reply = reply_to_call(OcppVersion::V201, "abc", "CostUpdated");
        let decoded = codec.decode(Bytes::from(reply)).unwrap();
        assert_eq!(
            decoded.envelope,
            Envelope::CallError {
                unique_id: "abc".to_string(),
                error_code: "NotImplemented".to_string()
            }
        );

        let accepted = reply_to_call(OcppVersion::V16, "r1", "Reset");
        assert_eq!(accepted, r#"[3,"r1",{"status":"Accepted"}]"#);
    }
}

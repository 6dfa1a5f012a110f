use thiserror::Error;

/// Longest charge point id accepted on the wire.
pub const MAX_DEVICE_ID_LEN: usize = 48;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("device id must not be empty")]
    EmptyDeviceId,
    #[error("device id longer than {MAX_DEVICE_ID_LEN} characters")]
    DeviceIdTooLong,
    #[error("device id contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
}

/// Checks that an id can be used verbatim as the first level of a topic.
pub fn validate_device_id(device_id: &str) -> Result<(), TopicError> {
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId);
    }
    if device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(TopicError::DeviceIdTooLong);
    }
    if let Some(c) = device_id
        .chars()
        .find(|c| matches!(c, '/' | '+' | '#') || !c.is_ascii_graphic())
    {
        return Err(TopicError::ForbiddenCharacter(c));
    }
    Ok(())
}

/// Topic the gateway publishes device frames to.
pub fn device_to_cloud_topic(device_id: &str) -> String {
    format!("{device_id}/in")
}

/// Topic the gateway subscribes to for frames destined to the device.
pub fn cloud_to_device_topic(device_id: &str) -> String {
    format!("{device_id}/out")
}

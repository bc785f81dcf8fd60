use crate::protocol::Message;

/// Segment used when a message carries no usable speed.
pub const INVALID_SPEED_SEGMENT: &str = "invalid";

/// Dedup key of a message: logically identical messages share a key.
pub fn message_key(message: &Message) -> String {
    match message {
        Message::ApplySettings { settings } => format!(
            "applySettings_{}_{}",
            if settings.enabled { "on" } else { "off" },
            speed_segment(settings.speed)
        ),
        Message::SpeedChanged { speed } => format!("speedChanged_{}", speed_segment(Some(*speed))),
        Message::GetStatus => "getStatus".to_string(),
    }
}

fn speed_segment(speed: Option<f64>) -> String {
    match speed {
        Some(s) if s.is_finite() => format!("{:.2}", s),
        _ => INVALID_SPEED_SEGMENT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SettingsPayload;

    #[test]
    fn test_apply_settings_keys() {
        assert_eq!(message_key(&Message::apply_settings(true, 1.25)), "applySettings_on_1.25");
        assert_eq!(message_key(&Message::apply_settings(false, 2.0)), "applySettings_off_2.00");
    }

    #[test]
    fn test_equivalent_speeds_collapse() {
        let a = message_key(&Message::apply_settings(true, 1.5));
        let b = message_key(&Message::apply_settings(true, 1.5000001));
        assert_eq!(a, b);
    }

    #[test]
    fn test_non_finite_speed_uses_sentinel() {
        let nan = Message::apply_settings(true, f64::NAN);
        let missing = Message::ApplySettings {
            settings: SettingsPayload {
                enabled: true,
                speed: None,
            },
        };
        assert_eq!(message_key(&nan), "applySettings_on_invalid");
        assert_eq!(message_key(&missing), "applySettings_on_invalid");
    }
}

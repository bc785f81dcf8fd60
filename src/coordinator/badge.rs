// Toolbar badge: short status text and a background color.

use parking_lot::Mutex;

pub const COLOR_OFF: &str = "#888888";
pub const COLOR_ON: &str = "#4CAF50";
pub const COLOR_ERROR: &str = "#F44336";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Badge {
    pub text: String,
    pub color: &'static str,
}

impl Badge {
    pub fn error() -> Self {
        Self {
            text: "ERR".into(),
            color: COLOR_ERROR,
        }
    }
}

/// Integer speeds print bare, others with one decimal rounded half away
/// from zero (`1.25` shows as `1.3`).
pub fn format_speed(speed: f64) -> String {
    if speed.fract() == 0.0 {
        format!("{}", speed as i64)
    } else {
        format!("{:.1}", (speed * 10.0).round() / 10.0)
    }
}

pub fn render_badge(enabled: bool, speed: Option<f64>) -> Badge {
    if !enabled {
        return Badge {
            text: "OFF".into(),
            color: COLOR_OFF,
        };
    }
    match speed.filter(|s| s.is_finite() && *s > 0.0) {
        Some(speed) => Badge {
            text: format_speed(speed),
            color: COLOR_ON,
        },
        None => Badge {
            text: "ON".into(),
            color: COLOR_ON,
        },
    }
}

/// Where the badge is drawn.
pub trait StatusIndicator: Send + Sync {
    fn render(&self, badge: &Badge);
}

/// Indicator that records what it was asked to draw.
#[derive(Default)]
pub struct MemoryIndicator {
    history: Mutex<Vec<Badge>>,
}

impl MemoryIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Badge> {
        self.history.lock().last().cloned()
    }

    pub fn history(&self) -> Vec<Badge> {
        self.history.lock().clone()
    }
}

impl StatusIndicator for MemoryIndicator {
    fn render(&self, badge: &Badge) {
        self.history.lock().push(badge.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_text() {
        assert_eq!(format_speed(2.0), "2");
        assert_eq!(format_speed(1.5), "1.5");
        assert_eq!(format_speed(1.25), "1.3");
        assert_eq!(format_speed(0.75), "0.8");
        assert_eq!(format_speed(16.0), "16");
    }

    #[test]
    fn test_render_states() {
        assert_eq!(render_badge(false, Some(2.0)).text, "OFF");
        assert_eq!(render_badge(false, None).color, COLOR_OFF);
        assert_eq!(render_badge(true, Some(1.5)), Badge {
            text: "1.5".into(),
            color: COLOR_ON,
        });
        assert_eq!(render_badge(true, None).text, "ON");
        assert_eq!(render_badge(true, Some(f64::NAN)).text, "ON");
    }

    #[test]
    fn test_memory_indicator_keeps_last() {
        let indicator = MemoryIndicator::new();
        assert_eq!(indicator.current(), None);
        indicator.render(&render_badge(true, None));
        indicator.render(&Badge::error());
        assert_eq!(indicator.current(), Some(Badge::error()));
        assert_eq!(indicator.history().len(), 2);
    }
}

use std::time::{SystemTime, UNIX_EPOCH};

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        match &self {
            Some(_) => (),
            None => inspector_function(),
        }
        self
    }
}

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn get_epoch_time_in_secs() -> u64 {
    get_epoch_time_in_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_none_runs_only_for_none() {
        let mut called = false;
        let value = Some(1).inspect_none(|| called = true);
        assert_eq!(value, Some(1));
        assert!(!called);

        let value: Option<u32> = None.inspect_none(|| called = true);
        assert!(value.is_none());
        assert!(called);
    }

    #[test]
    fn test_epoch_seconds_track_millis() {
        let ms = get_epoch_time_in_ms();
        let secs = get_epoch_time_in_secs();
        assert!(secs >= ms / 1000);
        assert!(secs - ms / 1000 <= 1);
    }
}

use std::time::{SystemTime, UNIX_EPOCH};

/// Значение для `publish-time` и `deliver-time`: Unix-время в миллисекундах.
pub fn now_ms() -> i64 {
    epoch_ms(SystemTime::now())
}

/// Момент до эпохи даёт 0, за пределами `i64` насыщается.
pub fn epoch_ms(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Проверить subject против NATS-паттерна.
///
/// - `*` совпадает ровно с одним токеном: `publish-offers.*` ~ `publish-offers.eu`
/// - `>` совпадает с одним и более токенами в хвосте: `offers.>` ~ `offers.eu.de`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return pat.next().is_none(),
            (Some("*"), Some(tok)) if !tok.is_empty() => {}
            (Some(p), Some(tok)) if p == tok && !tok.is_empty() => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Привести идентичность инстанса (обычно `$HOSTNAME`) к допустимому
/// имени durable consumer'а: NATS не разрешает `.`, `*`, `>`, пробелы
/// и разделители путей.
pub fn durable_name(raw: &str) -> String {
    let name: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' | '/' | '\\' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    name
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn epoch_ms_counts_whole_milliseconds() {
        let at = UNIX_EPOCH + Duration::from_micros(1_700_000_000_123_999);
        assert_eq!(epoch_ms(at), 1_700_000_000_123);
    }

    #[test]
    fn time_before_epoch_is_zero() {
        assert_eq!(epoch_ms(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}

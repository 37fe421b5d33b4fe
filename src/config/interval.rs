/// Parse interval string like "30s", "5m", "2h", "1d" into seconds.
pub fn parse_interval(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();

    if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .map(|h| h * 3600)
            .map_err(|_| format!("Invalid hours: {}", hours))
    } else if let Some(minutes) = s.strip_suffix('m') {
        minutes
            .parse::<u64>()
            .map(|m| m * 60)
            .map_err(|_| format!("Invalid minutes: {}", minutes))
    } else if let Some(days) = s.strip_suffix('d') {
        days.parse::<u64>()
            .map(|d| d * 86400)
            .map_err(|_| format!("Invalid days: {}", days))
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>()
            .map_err(|_| format!("Invalid seconds: {}", secs))
    } else {
        s.parse::<u64>()
            .map_err(|_| format!("Invalid interval: {}. Use format like '30s', '5m', '2h'", s))
    }
}

/// Format a number of seconds using the largest whole unit.
pub fn format_interval(secs: u64) -> String {
    if secs >= 86400 && secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("30s").unwrap(), 30);
        assert_eq!(parse_interval("5m").unwrap(), 300);
        assert_eq!(parse_interval("2h").unwrap(), 7200);
        assert_eq!(parse_interval("1d").unwrap(), 86400);
        assert_eq!(parse_interval(" 60 ").unwrap(), 60);
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("xm").is_err());
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(30), "30s");
        assert_eq!(format_interval(300), "5m");
        assert_eq!(format_interval(7200), "2h");
        assert_eq!(format_interval(86400), "1d");
        assert_eq!(format_interval(90), "90s");
    }
}

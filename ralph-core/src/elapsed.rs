/// Formats a duration in seconds using the orchestrator's bucketed style:
/// `Ss` below a minute, `MmSSs` below an hour, `HhMMm` from there on.
pub fn format_elapsed(total_seconds: u64) -> String {
    if total_seconds < 60 {
        format!("{total_seconds}s")
    } else if total_seconds < 3600 {
        let minutes = total_seconds / 60;
        let seconds = total_seconds % 60;
        format!("{minutes}m{seconds:02}s")
    } else {
        let hours = total_seconds / 3600;
        let minutes = (total_seconds % 3600) / 60;
        format!("{hours}h{minutes:02}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_table() {
        let cases: &[(u64, &str)] = &[
            (0, "0s"),
            (1, "1s"),
            (59, "59s"),
            (60, "1m00s"),
            (90, "1m30s"),
            (3599, "59m59s"),
            (3600, "1h00m"),
            (3661, "1h01m"),
            (7200, "2h00m"),
        ];
        for (secs, expected) in cases {
            assert_eq!(&format_elapsed(*secs), expected, "secs={secs}");
        }
    }
}

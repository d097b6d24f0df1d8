//! Recommendation composition.
//!
//! The composer asks the configured [`TextGenerator`] for a one-line
//! recommendation and falls back to a fixed table whenever the generator is
//! absent, slow, blocked or returns something unusable. Every path yields a
//! non-empty string of at most [`MAX_TEXT_LEN`](crate::model::MAX_TEXT_LEN) characters.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::generator::{FinishReason, Generation, GenerationRequest, GeneratorError, TextGenerator};
use crate::model::{clamp_text, Variable};
use crate::threshold::Severity;

/// Shortest generated text accepted, after trimming and quote stripping.
const MIN_GENERATED_LEN: usize = 10;

// ------------------------------------------------------------------ //
//  Trend                                                              //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Stable,
}

/// Coarse direction of a variable over the recent past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrendHint {
    pub samples: usize,
    pub direction: Trend,
}

impl TrendHint {
    /// Naive direction from oldest-first values: increasing iff the newest
    /// value is above the oldest.
    pub fn from_chronological(values: &[f64]) -> Self {
        let direction = match (values.first(), values.last()) {
            (Some(first), Some(last)) if values.len() >= 2 && last > first => Trend::Increasing,
            _ => Trend::Stable,
        };
        Self { samples: values.len(), direction }
    }
}

// ------------------------------------------------------------------ //
//  Outcome                                                            //
// ------------------------------------------------------------------ //

/// Why the deterministic table was used instead of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// No generator configured.
    NotConfigured,
    /// Generator disabled earlier in this process (model not found).
    Disabled,
    Timeout,
    Blocked(FinishReason),
    EmptyContent,
    TooShort(usize),
    Failed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NotConfigured => f.write_str("generator not configured"),
            FallbackReason::Disabled => f.write_str("generator disabled"),
            FallbackReason::Timeout => f.write_str("generator timed out"),
            FallbackReason::Blocked(r) => write!(f, "generation finished with {r:?}"),
            FallbackReason::EmptyContent => f.write_str("generated content was empty"),
            FallbackReason::TooShort(n) => write!(f, "generated text too short ({n} chars)"),
            FallbackReason::Failed(e) => write!(f, "generator error: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recommendation {
    Generated(String),
    FellBack { text: String, reason: FallbackReason },
}

impl Recommendation {
    pub fn text(&self) -> &str {
        match self {
            Recommendation::Generated(text) => text,
            Recommendation::FellBack { text, .. } => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Recommendation::Generated(text) => text,
            Recommendation::FellBack { text, .. } => text,
        }
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            Recommendation::Generated(_) => None,
            Recommendation::FellBack { reason, .. } => Some(reason),
        }
    }
}

/// Inputs for one recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationContext {
    pub variable: Variable,
    pub severity: Severity,
    pub floor_number: i32,
    pub value: f64,
    pub trend: Option<TrendHint>,
}

// ------------------------------------------------------------------ //
//  Fallback table                                                     //
// ------------------------------------------------------------------ //

/// Deterministic recommendation for `(variable, severity)`.
pub fn fallback_text(variable: Variable, severity: Severity, floor_number: i32, value: f64) -> String {
    let n = floor_number;
    match (variable, severity) {
        (Variable::Temperature, Severity::Critical) => {
            format!("Set Floor {n} setpoint to 24°C within the next 15 min.")
        }
        (Variable::Temperature, Severity::Medium) => {
            format!("Check the HVAC system on Floor {n} within the next hour.")
        }
        (Variable::Temperature, _) => format!("Monitor temperature on Floor {n}."),

        (Variable::Humidity, Severity::Critical) if value > 80.0 => {
            format!("Activate dehumidification on Floor {n} immediately.")
        }
        (Variable::Humidity, Severity::Critical) => {
            format!("Activate humidification on Floor {n} immediately.")
        }
        (Variable::Humidity, Severity::Medium) => {
            format!("Adjust humidity control on Floor {n} within the next hour.")
        }
        (Variable::Humidity, _) => format!("Check humidity on Floor {n}."),

        (Variable::Energy, Severity::Critical) => {
            format!("Rebalance the electrical load on Floor {n} within the next hour.")
        }
        (Variable::Energy, Severity::Medium) => format!("Review energy consumption on Floor {n}."),
        (Variable::Energy, _) => format!("Monitor energy on Floor {n}."),
    }
}

// ------------------------------------------------------------------ //
//  Prompt                                                             //
// ------------------------------------------------------------------ //

fn variable_label(v: Variable) -> &'static str {
    match v {
        Variable::Temperature => "temperature",
        Variable::Humidity    => "relative humidity",
        Variable::Energy      => "energy consumption",
    }
}

fn severity_label(s: Severity) -> &'static str {
    match s {
        Severity::None     => "no data",
        Severity::Info     => "informational",
        Severity::Medium   => "medium",
        Severity::Critical => "critical",
    }
}

pub fn build_prompt(ctx: &RecommendationContext) -> String {
    let n = ctx.floor_number;
    let unit = ctx.variable.unit();
    let trend_line = match ctx.trend {
        Some(TrendHint { direction: Trend::Increasing, samples }) => {
            format!("\n- Trend: values have been increasing across {samples} recent readings.")
        }
        _ => String::new(),
    };

    format!(
        r#"You are an expert in smart-building operations. Write ONE clear, specific, actionable recommendation.

CONTEXT:
- Floor: {n}
- Variable: {variable}
- Alert level: {level}
- Current value: {value}{unit}{trend_line}

STRICT REQUIREMENTS:
1. The recommendation must be SPECIFIC and ACTIONABLE
2. It MUST include a time frame (e.g. "within the next 15 min", "within the next hour", "immediately")
3. It MUST mention the floor number
4. At most 150 characters
5. Professional, direct tone
6. No explanations, only the recommendation

Examples of the expected format:
- "Set Floor {n} setpoint to 24°C within the next 15 min."
- "Increase ventilation on Floor {n}; check doors and louvres."
- "Rebalance the electrical load on Floor {n} within the next hour."
- "Activate dehumidification on Floor {n} immediately."

Reply with the recommendation only (no quotes, no explanations):"#,
        variable = variable_label(ctx.variable),
        level = severity_label(ctx.severity),
        value = ctx.value,
    )
}

/// Accept or reject the generator's first candidate.
fn accept(generation: Generation) -> Result<String, FallbackReason> {
    match generation.finish_reason {
        FinishReason::Stop | FinishReason::MaxTokens => {}
        other => return Err(FallbackReason::Blocked(other)),
    }

    let raw = generation.text.ok_or(FallbackReason::EmptyContent)?;
    let cleaned = raw.trim().trim_matches('"').trim_matches('\'').trim();
    if cleaned.is_empty() {
        return Err(FallbackReason::EmptyContent);
    }
    let len = cleaned.chars().count();
    if len < MIN_GENERATED_LEN {
        return Err(FallbackReason::TooShort(len));
    }
    Ok(clamp_text(cleaned))
}

// ------------------------------------------------------------------ //
//  Composer                                                           //
// ------------------------------------------------------------------ //

pub struct RecommendationComposer {
    generator: Option<Arc<dyn TextGenerator>>,
    timeout: Duration,
    disabled: AtomicBool,
}

impl RecommendationComposer {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

    /// Composer that never calls out; always uses the fallback table.
    pub fn fallback_only() -> Self {
        Self {
            generator: None,
            timeout: Self::DEFAULT_TIMEOUT,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn with_generator(generator: Arc<dyn TextGenerator>, timeout: Duration) -> Self {
        Self {
            generator: Some(generator),
            timeout,
            disabled: AtomicBool::new(false),
        }
    }

    pub fn generator_enabled(&self) -> bool {
        self.generator.is_some() && !self.disabled.load(Ordering::Relaxed)
    }

    /// Compose a recommendation. Never fails.
    pub async fn compose(&self, ctx: &RecommendationContext) -> Recommendation {
        let outcome = match &self.generator {
            None => Err(FallbackReason::NotConfigured),
            Some(_) if self.disabled.load(Ordering::Relaxed) => Err(FallbackReason::Disabled),
            Some(generator) => self.try_generate(generator.as_ref(), ctx).await,
        };

        match outcome {
            Ok(text) => {
                info!(
                    floor = ctx.floor_number,
                    variable = %ctx.variable,
                    "recommendation generated"
                );
                Recommendation::Generated(text)
            }
            Err(reason) => {
                let text = clamp_text(&fallback_text(
                    ctx.variable,
                    ctx.severity,
                    ctx.floor_number,
                    ctx.value,
                ));
                match reason {
                    FallbackReason::NotConfigured | FallbackReason::Disabled => {
                        debug!(%reason, "using fallback recommendation")
                    }
                    _ => warn!(
                        %reason,
                        floor = ctx.floor_number,
                        variable = %ctx.variable,
                        "using fallback recommendation"
                    ),
                }
                Recommendation::FellBack { text, reason }
            }
        }
    }

    async fn try_generate(
        &self,
        generator: &dyn TextGenerator,
        ctx: &RecommendationContext,
    ) -> Result<String, FallbackReason> {
        let request = GenerationRequest {
            prompt: build_prompt(ctx),
            temperature: 0.7,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 100,
            permissive_filters: true,
        };

        debug!(generator = generator.name(), floor = ctx.floor_number, "requesting recommendation");
        let generation = match tokio::time::timeout(self.timeout, generator.generate(&request)).await {
            Err(_) => return Err(FallbackReason::Timeout),
            Ok(Err(GeneratorError::ModelNotFound(model))) => {
                warn!(model = %model, "model not found, disabling generator for this process");
                self.disabled.store(true, Ordering::Relaxed);
                return Err(FallbackReason::Failed(format!("model '{model}' not found")));
            }
            Ok(Err(e)) => return Err(FallbackReason::Failed(e.to_string())),
            Ok(Ok(g)) => g,
        };

        accept(generation)
    }
}

impl fmt::Debug for RecommendationComposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecommendationComposer")
            .field("generator", &self.generator.as_ref().map(|g| g.name().to_string()))
            .field("timeout", &self.timeout)
            .field("disabled", &self.disabled.load(Ordering::Relaxed))
            .finish()
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MAX_TEXT_LEN;
    use crate::generator::{ScriptStep, ScriptedGenerator};

    fn ctx(variable: Variable, severity: Severity, value: f64) -> RecommendationContext {
        RecommendationContext {
            variable,
            severity,
            floor_number: 3,
            value,
            trend: None,
        }
    }

    fn composer(steps: Vec<ScriptStep>) -> (RecommendationComposer, Arc<ScriptedGenerator>) {
        let g = Arc::new(ScriptedGenerator::new(steps));
        let c = RecommendationComposer::with_generator(g.clone(), Duration::from_secs(2));
        (c, g)
    }

    #[test]
    fn fallback_table_names_floor() {
        for v in Variable::ALL {
            for s in [Severity::Info, Severity::Medium, Severity::Critical] {
                let text = fallback_text(v, s, 7, 50.0);
                assert!(text.contains("Floor 7"), "{text}");
                assert!(!text.is_empty() && text.chars().count() <= MAX_TEXT_LEN);
            }
        }
    }

    #[test]
    fn humidity_critical_direction() {
        assert_eq!(
            fallback_text(Variable::Humidity, Severity::Critical, 1, 85.0),
            "Activate dehumidification on Floor 1 immediately."
        );
        assert_eq!(
            fallback_text(Variable::Humidity, Severity::Critical, 1, 15.0),
            "Activate humidification on Floor 1 immediately."
        );
        // exactly 80 is not "above 80"
        assert!(fallback_text(Variable::Humidity, Severity::Critical, 1, 80.0).contains("humidification"));
    }

    #[test]
    fn temperature_critical_is_time_boxed() {
        let text = fallback_text(Variable::Temperature, Severity::Critical, 3, 30.0);
        assert_eq!(text, "Set Floor 3 setpoint to 24°C within the next 15 min.");
    }

    #[test]
    fn prompt_embeds_context() {
        let mut c = ctx(Variable::Humidity, Severity::Critical, 85.0);
        c.trend = Some(TrendHint { samples: 4, direction: Trend::Increasing });
        let p = build_prompt(&c);
        assert!(p.contains("- Floor: 3"));
        assert!(p.contains("relative humidity"));
        assert!(p.contains("critical"));
        assert!(p.contains("85%"));
        assert!(p.contains("increasing"));
        assert!(p.contains("within the next hour"));
    }

    #[test]
    fn prompt_omits_stable_trend() {
        let mut c = ctx(Variable::Energy, Severity::Medium, 12.0);
        c.trend = Some(TrendHint { samples: 4, direction: Trend::Stable });
        assert!(!build_prompt(&c).contains("Trend:"));
    }

    #[test]
    fn trend_from_values() {
        assert_eq!(TrendHint::from_chronological(&[]).direction, Trend::Stable);
        assert_eq!(TrendHint::from_chronological(&[5.0]).direction, Trend::Stable);
        assert_eq!(TrendHint::from_chronological(&[5.0, 4.0, 6.0]).direction, Trend::Increasing);
        assert_eq!(TrendHint::from_chronological(&[5.0, 9.0, 5.0]).direction, Trend::Stable);
        assert_eq!(TrendHint::from_chronological(&[1.0, 2.0]).samples, 2);
    }

    #[tokio::test]
    async fn no_generator_uses_fallback() {
        let c = RecommendationComposer::fallback_only();
        let r = c.compose(&ctx(Variable::Energy, Severity::Critical, 20.0)).await;
        assert_eq!(r.fallback_reason(), Some(&FallbackReason::NotConfigured));
        assert!(r.text().contains("Floor 3"));
    }

    #[tokio::test]
    async fn stop_with_quotes_is_accepted_and_stripped() {
        let (c, _) = composer(vec![ScriptStep::stop("  \"Lower Floor 3 setpoint to 24°C now.\"  ")]);
        let r = c.compose(&ctx(Variable::Temperature, Severity::Critical, 30.0)).await;
        assert_eq!(r, Recommendation::Generated("Lower Floor 3 setpoint to 24°C now.".into()));
    }

    #[tokio::test]
    async fn max_tokens_partial_text_is_accepted() {
        let (c, _) = composer(vec![ScriptStep::finished(
            FinishReason::MaxTokens,
            Some("Activate cooling on Floor 3 within"),
        )]);
        let r = c.compose(&ctx(Variable::Temperature, Severity::Medium, 28.5)).await;
        assert_eq!(r.text(), "Activate cooling on Floor 3 within");
        assert!(r.fallback_reason().is_none());
    }

    #[tokio::test]
    async fn max_tokens_short_text_falls_back() {
        let (c, _) = composer(vec![ScriptStep::finished(FinishReason::MaxTokens, Some("Act"))]);
        let r = c.compose(&ctx(Variable::Temperature, Severity::Medium, 28.5)).await;
        assert_eq!(r.fallback_reason(), Some(&FallbackReason::TooShort(3)));
    }

    #[tokio::test]
    async fn safety_and_recitation_fall_back() {
        for reason in [FinishReason::Safety, FinishReason::Recitation, FinishReason::Other] {
            let (c, _) = composer(vec![ScriptStep::finished(reason, Some("A perfectly long reply."))]);
            let r = c.compose(&ctx(Variable::Energy, Severity::Medium, 12.0)).await;
            assert_eq!(r.fallback_reason(), Some(&FallbackReason::Blocked(reason)));
            assert_eq!(r.text(), "Review energy consumption on Floor 3.");
        }
    }

    #[tokio::test]
    async fn short_reply_after_stripping_falls_back() {
        let (c, _) = composer(vec![ScriptStep::stop("'\"ok now\"'")]);
        let r = c.compose(&ctx(Variable::Energy, Severity::Medium, 12.0)).await;
        assert!(matches!(r.fallback_reason(), Some(FallbackReason::TooShort(_))));
    }

    #[tokio::test]
    async fn stop_without_content_falls_back() {
        let (c, _) = composer(vec![ScriptStep::finished(FinishReason::Stop, None)]);
        let r = c.compose(&ctx(Variable::Energy, Severity::Medium, 12.0)).await;
        assert_eq!(r.fallback_reason(), Some(&FallbackReason::EmptyContent));
    }

    #[tokio::test]
    async fn long_reply_is_truncated() {
        let long = "Reduce load on Floor 3 ".repeat(30);
        let (c, _) = composer(vec![ScriptStep::stop(&long)]);
        let r = c.compose(&ctx(Variable::Energy, Severity::Critical, 20.0)).await;
        assert!(r.fallback_reason().is_none());
        assert_eq!(r.text().chars().count(), MAX_TEXT_LEN);
    }

    #[tokio::test]
    async fn http_error_falls_back() {
        let (c, _) = composer(vec![ScriptStep::Status(500)]);
        let r = c.compose(&ctx(Variable::Humidity, Severity::Medium, 78.0)).await;
        assert!(matches!(r.fallback_reason(), Some(FallbackReason::Failed(_))));
        assert!(c.generator_enabled());
    }

    #[tokio::test]
    async fn model_not_found_disables_generator() {
        let (c, g) = composer(vec![ScriptStep::NotFound, ScriptStep::stop("never reached here")]);
        let first = c.compose(&ctx(Variable::Humidity, Severity::Medium, 78.0)).await;
        assert!(matches!(first.fallback_reason(), Some(FallbackReason::Failed(_))));
        assert!(!c.generator_enabled());

        let second = c.compose(&ctx(Variable::Humidity, Severity::Medium, 78.0)).await;
        assert_eq!(second.fallback_reason(), Some(&FallbackReason::Disabled));
        assert_eq!(g.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_times_out() {
        let slow = ScriptStep::Stall(
            Duration::from_secs(30),
            Generation { finish_reason: FinishReason::Stop, text: Some("too late to matter".into()) },
        );
        let (c, _) = composer(vec![slow]);
        let r = c.compose(&ctx(Variable::Temperature, Severity::Critical, 31.0)).await;
        assert_eq!(r.fallback_reason(), Some(&FallbackReason::Timeout));
        assert!(r.text().contains("15 min"));
    }
}

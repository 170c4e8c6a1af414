//! Cost estimation for provider calls (§6), in hundredths-of-a-cent.
//!
//! Rate tables and rounding rules transcribed from
//! `original_source/backend/app/infrastructure/pricing.py`.

const GROQ_COST_PER_1K_TOKENS_HUNDREDTH_CENTS: f64 = 2.7;
const GEMINI_COST_PER_1K_TOKENS_HUNDREDTH_CENTS: f64 = 4.0;

/// Deepgram Nova-2: $0.0043/minute = 0.43 cents/minute ≈ 0.7166667 hundredths-of-cents/second.
const DEEPGRAM_COST_PER_SECOND_HUNDREDTHS: f64 = 0.7166667;
const DEEPGRAM_FLUX_COST_PER_SECOND_HUNDREDTHS: f64 = 1.2833333;

/// Google Cloud TTS Neural2: $16/million characters = 0.16 hundredths-of-cents/char.
const GOOGLE_TTS_COST_PER_CHAR_HUNDREDTHS: f64 = 0.16;

fn llm_input_rate(provider: &str, model: &str) -> Option<f64> {
    match (provider, model) {
        ("groq", "llama-3.1-8b-instant") => Some(0.5),
        ("groq", "llama-3.3-70b-versatile") => Some(5.9),
        ("groq", "meta-llama/llama-guard-4-12b") => Some(2.0),
        ("groq", "openai/gpt-oss-120b") => Some(1.5),
        ("groq", "openai/gpt-oss-20b") => Some(0.75),
        ("gemini", "gemini-2.5-pro") => Some(12.5),
        ("gemini", "gemini-2.5-flash") => Some(3.0),
        ("gemini", "gemini-2.5-flash-lite") => Some(1.0),
        ("openrouter", "nvidia/nemotron-3-nano-30b-a3b:free") => Some(0.0),
        _ => None,
    }
}

fn llm_output_rate(provider: &str, model: &str) -> Option<f64> {
    match (provider, model) {
        ("groq", "llama-3.1-8b-instant") => Some(0.8),
        ("groq", "llama-3.3-70b-versatile") => Some(7.9),
        ("groq", "meta-llama/llama-guard-4-12b") => Some(2.0),
        ("groq", "openai/gpt-oss-120b") => Some(6.0),
        ("groq", "openai/gpt-oss-20b") => Some(3.0),
        ("gemini", "gemini-2.5-pro") => Some(100.0),
        ("gemini", "gemini-2.5-flash") => Some(25.0),
        ("gemini", "gemini-2.5-flash-lite") => Some(4.0),
        ("openrouter", "nvidia/nemotron-3-nano-30b-a3b:free") => Some(0.0),
        _ => None,
    }
}

/// Estimate LLM call cost. Prefers an explicit per-(provider, model) rate,
/// falling back to a provider-level default keyed on whether the provider
/// name contains "gemini".
pub fn estimate_llm_cost_cents(
    provider: Option<&str>,
    model: Option<&str>,
    tokens_in: Option<u64>,
    tokens_out: Option<u64>,
) -> i64 {
    let total_tokens = tokens_in.unwrap_or(0) + tokens_out.unwrap_or(0);
    if total_tokens == 0 {
        return 0;
    }

    let provider_name = provider.unwrap_or("").to_lowercase();
    let model_name = model.unwrap_or("").to_lowercase();

    let mut in_rate = llm_input_rate(&provider_name, &model_name);
    let mut out_rate = llm_output_rate(&provider_name, &model_name);

    if in_rate.is_none() || out_rate.is_none() {
        let default_rate = if provider_name.contains("gemini") {
            GEMINI_COST_PER_1K_TOKENS_HUNDREDTH_CENTS
        } else {
            GROQ_COST_PER_1K_TOKENS_HUNDREDTH_CENTS
        };
        in_rate = Some(in_rate.unwrap_or(default_rate));
        out_rate = Some(out_rate.unwrap_or(default_rate));
    }

    let mut cost = 0.0;
    if let Some(tokens) = tokens_in {
        cost += (tokens as f64 / 1000.0) * in_rate.unwrap();
    }
    if let Some(tokens) = tokens_out {
        cost += (tokens as f64 / 1000.0) * out_rate.unwrap();
    }

    if cost <= 0.0 {
        return 0;
    }

    // Round to the nearest unit so a very small but non-zero call still
    // registers as a minimal cost instead of flooring to 0.
    let units = cost.round() as i64;
    units.max(1)
}

/// Estimate STT call cost from audio duration. Defaults to zero for
/// providers other than Deepgram.
pub fn estimate_stt_cost_cents(provider: Option<&str>, model: Option<&str>, audio_duration_ms: Option<i64>) -> i64 {
    let duration_ms = match audio_duration_ms {
        Some(ms) if ms > 0 => ms,
        _ => return 0,
    };

    let provider_name = provider.unwrap_or("").to_lowercase();
    let model_name = model.unwrap_or("").to_lowercase();

    let rate_per_second = match (provider_name.as_str(), model_name.as_str()) {
        ("deepgram", "nova-2") => DEEPGRAM_COST_PER_SECOND_HUNDREDTHS,
        ("deepgram", "flux-general-en") => DEEPGRAM_FLUX_COST_PER_SECOND_HUNDREDTHS,
        _ if provider_name.contains("deepgram") => DEEPGRAM_COST_PER_SECOND_HUNDREDTHS,
        _ => 0.0,
    };

    let duration_seconds = duration_ms as f64 / 1000.0;
    (duration_seconds * rate_per_second) as i64
}

/// Estimate TTS call cost from synthesized text length. Defaults to zero
/// for providers other than Google.
pub fn estimate_tts_cost_cents(provider: Option<&str>, model: Option<&str>, text_length: Option<i64>) -> i64 {
    let length = match text_length {
        Some(len) if len > 0 => len,
        _ => return 0,
    };

    let provider_name = provider.unwrap_or("").to_lowercase();
    let model_name = model.unwrap_or("").to_lowercase();

    let rate_per_char = match (provider_name.as_str(), model_name.as_str()) {
        ("google", "neural2") => GOOGLE_TTS_COST_PER_CHAR_HUNDREDTHS,
        _ if provider_name.contains("google") => GOOGLE_TTS_COST_PER_CHAR_HUNDREDTHS,
        _ => 0.0,
    };

    (length as f64 * rate_per_char) as i64
}

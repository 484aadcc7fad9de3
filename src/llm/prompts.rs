//! LLM prompts for extraction, insight generation and the judges.
//!
//! Judge prompts are explanation-first: the model reasons before it labels,
//! and invoice data is fenced between [BEGIN DATA] / [END DATA] markers.
//! Placeholders in braces are filled with `str::replace`.

/// Collection of prompts used by the pipeline.
pub struct Prompts;

impl Prompts {
    /// System prompt for the vision extraction call.
    pub fn system_invoice_reader() -> &'static str {
        "You are an expert invoice reader. You transcribe scanned invoices into structured data exactly as printed. Always respond with valid JSON when requested."
    }

    /// Instruction sent alongside the invoice image.
    pub fn extract_invoice() -> &'static str {
        r#"Extract ALL text and data from this invoice image, then return it as structured JSON.

Use numbers (not strings) for amounts and quantities. Use null for anything not printed on the invoice. Do not compute values that are not printed, except line_total when only quantity and unit price are shown.

The response should be in the following JSON format:
{
    "raw_text": "<every piece of text visible on the invoice, in reading order>",
    "vendor": "<vendor / seller name or null>",
    "invoice_number": "<invoice number or null>",
    "date": "<invoice date as printed or null>",
    "currency": "<ISO currency code or symbol, or null>",
    "line_items": [
        {
            "description": "<item description>",
            "quantity": <number or null>,
            "unit_price": <number or null>,
            "line_total": <number or null>
        }
    ],
    "subtotal": <number or null>,
    "tax": <number or null>,
    "grand_total": <number or null>,
    "payment_terms": "<payment terms or null>"
}

Directly return the final JSON structure. Do not output anything else."#
    }

    /// System prompt for insight generation.
    pub fn system_financial_analyst() -> &'static str {
        r#"You are an expert financial analyst. Given invoice data, generate interesting and actionable insights.

Decide how many insights are appropriate for the invoice complexity, anywhere from 2 to 10. Let the data guide you.

Each insight should be:
- Specific and reference actual data from the invoice
- Useful for business decision-making
- Clear and concise (1-2 sentences each)

Return ONLY a numbered list of insights, nothing else."#
    }

    /// User prompt for insight generation.
    pub fn generate_insights() -> &'static str {
        r#"Analyze this invoice data and generate insights.
You decide how many insights are appropriate for this invoice.

Invoice Data:
{invoice}

Generate your insights:"#
    }

    /// Accuracy judge: per-insight factual classification.
    pub fn judge_accuracy() -> &'static str {
        r#"You are an expert invoice auditor. Your task is to evaluate the FACTUAL ACCURACY of generated insights against the source invoice data.

Definitions:
- "Factual accuracy" means whether each insight's claims (numbers, dates, names, calculations) exactly match the source invoice data.
- A "hallucination" is any claim not supported by or contradicting the invoice data. Totals, sums or percentages that cannot be derived from the invoice are hallucinations.

[BEGIN DATA]
[Invoice Data]
{invoice}

[Computed Checks]
{checks}

[Generated Insights]
{insights}
[END DATA]

Evaluate step by step. For each insight, classify it as:
- "factual": all claims match the invoice data exactly
- "hallucinated": contains information not in the invoice or contradicts it
- "partial": some claims are correct but others are wrong or unsupported
For any non-factual insight, quote the specific problematic claim.

After your analysis, produce your final verdict as JSON:
{
    "explanation": "<your step-by-step reasoning>",
    "per_insight": [
        {"insight": 1, "label": "factual|hallucinated|partial", "issue": "<null or description of problem>"}
    ],
    "accuracy_score": <0-100, percentage of insights that are fully factual>
}"#
    }

    /// Completeness judge: coverage of salient invoice fields.
    pub fn judge_completeness() -> &'static str {
        r#"You are an expert invoice auditor. Your task is to evaluate the COMPLETENESS of generated insights against the source invoice data.

Definitions:
- "Completeness" means whether the insights, taken together, reference the salient data points of the invoice.
- A data point is "covered" if at least one insight references it, and "missing" otherwise.

[BEGIN DATA]
[Invoice Data]
{invoice}

[Salient Data Points]
{salient}

[Generated Insights]
{insights}
[END DATA]

Evaluate step by step:
1. For each salient data point, decide whether it is covered or missing.
2. Note any anomaly listed among the salient data points that the insights fail to mention.

After your analysis, produce your final verdict as JSON:
{
    "explanation": "<your step-by-step reasoning>",
    "covered": ["<data points referenced in insights>"],
    "missing": ["<data points NOT referenced in any insight>"],
    "completeness_score": <0-100, percentage of data points covered>
}"#
    }

    /// Clarity judge: rubric over the insights alone.
    pub fn judge_clarity() -> &'static str {
        r#"You are an expert content evaluator. Your task is to assess the quality of generated invoice insights using the rubric below.

[BEGIN DATA]
[Generated Insights]
{insights}
[END DATA]

CLARITY (Is each insight easy to understand?)
- excellent: Every insight is immediately clear with no ambiguity
- good: Most insights are clear, minor ambiguity in one or two
- fair: Several insights require re-reading to understand
- poor: Most insights are confusing or poorly worded

SPECIFICITY (Does each insight reference concrete data?)
- excellent: Every insight cites specific numbers, dates, or names
- good: Most insights reference specific data, a few are generic
- fair: Insights are mostly generic with occasional specific references
- poor: Insights are vague and could apply to any invoice

DIVERSITY (Are the insights non-repetitive and cover different aspects?)
- excellent: Each insight covers a distinct aspect with no overlap
- good: Minor thematic overlap between one or two insights
- fair: Several insights cover the same aspect or repeat information
- poor: Most insights are redundant or repetitive

ACTIONABILITY (Does each insight provide useful, non-obvious information?)
- excellent: Insights surface patterns, anomalies, or actionable observations
- good: Most insights go beyond restating data to add value
- fair: Insights mostly restate invoice data without adding interpretation
- poor: Insights are trivial restatements that add no value

First, explain your reasoning for each criterion. Then classify each criterion into one of the four levels.

Produce your final verdict as JSON:
{
    "explanation": "<your reasoning for each criterion>",
    "clarity": "excellent|good|fair|poor",
    "specificity": "excellent|good|fair|poor",
    "diversity": "excellent|good|fair|poor",
    "actionability": "excellent|good|fair|poor"
}"#
    }

    /// Consistency judge: structured fields against the raw transcription.
    pub fn judge_consistency() -> &'static str {
        r#"You are an expert data reconciliation analyst. Your task is to compare two representations of the same invoice and determine whether they agree on all key data points.

Definitions:
- "Match" means both sources report the same value for a data point (minor formatting differences like "$1,000" vs "1000.00" are acceptable matches).
- "Mismatch" means the sources report different values, or one source includes a data point the other is missing entirely.

[BEGIN DATA]
[Source A: Structured Fields]
{invoice}

[Source B: Raw Transcription]
{raw_text}
[END DATA]

Evaluate step by step:
1. Identify every key data point present in either source.
2. For each data point, compare the values from both sources.
3. Classify each data point as "match" or "mismatch". For mismatches, quote the value from each source.

After your analysis, produce your final verdict as JSON:
{
    "explanation": "<your step-by-step comparison reasoning>",
    "matches": [{"field": "<name>", "value": "<agreed value>"}],
    "mismatches": [{"field": "<name>", "structured": "<value from A>", "raw": "<value from B>"}],
    "score": <0-100, percentage of fields that match>
}"#
    }

    /// System prompt shared by all judges.
    pub fn system_judge() -> &'static str {
        "You are an impartial evaluator of generated financial analysis. Reason before you decide, and always end with the requested JSON."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_are_not_empty() {
        assert!(!Prompts::extract_invoice().is_empty());
        assert!(!Prompts::system_financial_analyst().is_empty());
        assert!(!Prompts::judge_accuracy().is_empty());
        assert!(!Prompts::judge_completeness().is_empty());
        assert!(!Prompts::judge_clarity().is_empty());
        assert!(!Prompts::judge_consistency().is_empty());
    }

    #[test]
    fn test_judge_prompts_carry_placeholders() {
        assert!(Prompts::judge_accuracy().contains("{invoice}"));
        assert!(Prompts::judge_accuracy().contains("{checks}"));
        assert!(Prompts::judge_accuracy().contains("{insights}"));
        assert!(Prompts::judge_completeness().contains("{salient}"));
        assert!(!Prompts::judge_clarity().contains("{invoice}"));
        assert!(Prompts::judge_consistency().contains("{raw_text}"));
        assert!(Prompts::generate_insights().contains("{invoice}"));
    }
}

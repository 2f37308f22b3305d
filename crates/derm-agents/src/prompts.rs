//! Prompt builders for each pipeline stage and for follow-up questions.
//!
//! Each builder takes the typed outputs of earlier stages and returns a
//! [`Prompt`]. Earlier stage text is only ever *included* in later prompts;
//! nothing here parses it.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever instruction content changes.

use coordination::{ArbitrationOutcome, ClassificationResult};

use crate::generation::Prompt;
use crate::types::{LatestContext, StageResult};

/// Prompt version. Bump on any instruction content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Conditions for which the Diagnose stage must assess skin-cancer likelihood.
pub const DISEASE_CATALOGUE: [&str; 9] = [
    "Actinic Keratosis",
    "Atopic Dermatitis",
    "Benign Keratosis",
    "Dermatofibroma",
    "Melanocytic Nevus",
    "Melanoma",
    "Squamous Cell Carcinoma",
    "Tinea Ringworm Candidiasis",
    "Vascular Lesion",
];

/// Placeholder used when no diagnosis has been completed yet.
pub const NO_CONTEXT: &str = "No context available";

pub const VERIFY_INSTRUCTION: &str = "\
Analyze the given skin image as an expert dermatologist to determine if the skin is healthy or unhealthy.
- Provide a realistic confidence percentage based on visual clarity and distinct presentation of symptoms. Do NOT force it to be 100%.
- If healthy, classify it as 'Healthy' and provide the confidence level in percentage.
- If unhealthy, classify it as 'Unhealthy' and provide the confidence level in percentage.
- Additionally, determine the skin type as one of the following: 'Dry', 'Oily', or 'Normal'.
- Answer strictly in <classification>,<confidence score in percent>,<skin type>,<remarks in one to two lines> format only.";

const REPORT_STRUCTURE: &str = "\
**Required Report Structure (Use Markdown):**

### 1. Detailed Clinical Observations
- Describe lesion morphology (size, color, texture, borders).
- Note anatomical location and distribution patterns.
- Mention any visible signs of inflammation, scaling, or ulceration.

### 2. Differential Diagnosis & Reasoning
- **Primary Diagnosis**: Explain why the suspected condition is the most likely diagnosis based on visual evidence.
- **Differentials**: List 2-3 other conditions that share similar features but are less likely, and explain why.

### 3. Pathophysiology (Brief)
- Explain the underlying biological mechanism of the primary condition.

### 4. Comprehensive Management Plan
- **Pharmacological**: Suggest generic classes of topical/oral medications.
- **Lifestyle & Hygiene**: Specific advice on skincare, diet, and triggers.
- **Home Care**: Actionable steps for the patient.

### 5. Prognosis & Follow-up
- Expected course of the condition.
- Warning signs that require immediate medical attention.

**Tone:** Professional, clinical, and empathetic.
**Format:** strictly markdown, no preamble.";

const ADVISORY_GUIDE: &str = "\
### 1. Understand & Analyze the Case
- Identify the disease or condition being discussed.
- Analyze symptoms, affected areas, and disease progression based on the report.

### 2. Latest Treatment Recommendations
- Use current treatment guidelines, approved drugs, and clinical trials.
- Explain the best available options, including topical, oral, biologic, and advanced therapies.

### 3. Prescription Plan
- Suggest medications, dosages, frequency, and possible side effects.
- Warn about contraindications or potential drug interactions.

### 4. Next Steps
- Recommend further diagnostic tests (e.g., biopsy, dermoscopy, blood tests).
- Suggest follow-up intervals and monitoring plans.

### 5. Sources
- Cite research-backed sources such as PubMed, JAMA Dermatology, The Lancet, FDA, and WHO.

Write for dermatologists, not a lay audience, as one doctor advising another. \
Summarize the complete instruction in 4 to 5 points, in proper markdown.";

fn describe(result: &ClassificationResult) -> String {
    format!("{} (Confidence: {:.2})", result.label, result.confidence)
}

/// Stage 1: is the skin healthy, and what skin type is it.
pub fn verify_prompt() -> Prompt {
    Prompt::text(
        VERIFY_INSTRUCTION,
        "Please analyze this skin image and verify whether it is healthy.",
    )
}

/// Stage 2: disease, confidence and remarks, seeded by the classifiers.
pub fn diagnose_prompt(arbitration: &ArbitrationOutcome, verify: &StageResult) -> Prompt {
    let catalogue = DISEASE_CATALOGUE
        .iter()
        .map(|d| format!("'{d}'"))
        .collect::<Vec<_>>()
        .join(", ");
    let instruction = format!(
        "Analyze the given skin image as an expert dermatologist. \
If the skin appears healthy, classify the prediction as 'Healthy' and provide the confidence level. \
If unhealthy, use the model output to determine the disease. \
The prediction by the deep learning model is {primary}; the secondary prediction is {secondary}. \
If classified as one of the following: {catalogue}, assess the likelihood of skin cancer, otherwise treat it as a disease. \
Provide the disease name, confidence level, and remarks. \
Additionally, include possible symptoms that might be present for further diagnostic evaluation.

Context from previous analysis: {verify}

- Answer strictly in <disease>,<confidence score in percent>,<remarks in two to three lines> format only.
- If the skin appears healthy, classify it as 'Healthy' and provide the confidence level in percentage.",
        primary = describe(&arbitration.primary),
        secondary = describe(&arbitration.secondary),
        verify = verify.text,
    );
    Prompt::text(instruction, "Please analyze this skin image and diagnose the condition.")
}

/// Stage 3: full clinical report.
pub fn report_prompt(arbitration: &ArbitrationOutcome, diagnose: &StageResult) -> Prompt {
    let instruction = format!(
        "Act as a senior consultant dermatologist. \
Generate a highly detailed and comprehensive medical report for the following case.

**Patient Analysis Context:**
- Suspected Condition: {primary}
- Secondary Possibility: {secondary}
- Diagnostic Assessment: {diagnosis}

{REPORT_STRUCTURE}",
        primary = describe(&arbitration.primary),
        secondary = describe(&arbitration.secondary),
        diagnosis = diagnose.text,
    );
    Prompt::text(
        instruction,
        "Please analyze this skin image and its diagnostic context and generate a report a dermatologist can act on.",
    )
}

/// Remarks on primary vs secondary classification, carried into the advisory.
pub fn arbitration_remarks(arbitration: &ArbitrationOutcome) -> String {
    let primary = describe(&arbitration.primary);
    let secondary = describe(&arbitration.secondary);
    if arbitration.labels_agree() {
        format!(
            "- **{primary}** is the primary concern; both classifiers agree on this condition \
(secondary confidence {:.2}).",
            arbitration.secondary.confidence
        )
    } else {
        format!(
            "- **{primary}** is the primary concern and should be prioritized for diagnosis and treatment.\n\
- **{secondary}** may be a secondary condition or share similar symptoms. \
Further medical evaluation is recommended to rule it out."
        )
    }
}

/// Stage 4: guidance for the treating doctor. Text only.
pub fn advisory_prompt(
    arbitration: &ArbitrationOutcome,
    report: &StageResult,
    diagnose: &StageResult,
) -> Prompt {
    let instruction = format!(
        "You are a dermatology assistant providing expert-level support to dermatologists. \
Analyze the report below, recommend evidence-based treatments, and guide the doctor on next steps \
using the latest research and drug discoveries.

The most likely condition is **{primary_label}** with a confidence of {primary_conf:.2}. \
There is a minor possibility of **{secondary_label}** with a confidence of {secondary_conf:.2}.

**Remarks:**
{remarks}

**Report:**
{report}

**Diagnosis:**
{diagnosis}

{ADVISORY_GUIDE}",
        primary_label = arbitration.primary.label,
        primary_conf = arbitration.primary.confidence,
        secondary_label = arbitration.secondary.label,
        secondary_conf = arbitration.secondary.confidence,
        remarks = arbitration_remarks(arbitration),
        report = report.text,
        diagnosis = diagnose.text,
    );
    Prompt::text(
        instruction,
        "Please analyze this skin diagnostics report and give instructions to the doctor.",
    )
}

/// Single-shot follow-up question answered against the latest diagnosis.
pub fn follow_up_prompt(query: &str, context: Option<&LatestContext>, deep_search: bool) -> Prompt {
    let context = context.map(LatestContext::render);
    let context = context.as_deref().unwrap_or(NO_CONTEXT);
    let guidance = if deep_search {
        "- Research the question thoroughly across recent literature and clinical guidelines.\n\
- Provide a structured, detailed answer.\n\
- Include references."
    } else {
        "- Provide a concise answer.\n- Include references."
    };
    let instruction = format!(
        "Analyze the given question as an expert dermatologist.\n\
Diagnosis context: {context}.\n\
{guidance}"
    );
    Prompt::text(instruction, query)
}

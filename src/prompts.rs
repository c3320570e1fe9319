// Instruction templates for the three agent stages: extraction, QA and reconciliation.
// Every renderer is a pure function of its arguments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::render_json_list;

/// Request/task pair bound to every extractable content unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPrompts {
    pub request: String,
    pub task: String,
}

/// Renders the extraction request and task prompts.
///
/// `field_block` is the catalog's labelled field sections, `field_descriptions` the short
/// bullet list of the same fields.
pub fn render_extraction_prompt(field_block: &str, field_descriptions: &str) -> ExtractionPrompts {
    ExtractionPrompts {
        request: render_extraction_request(field_block),
        task: render_extraction_task(field_descriptions),
    }
}

fn render_extraction_request(field_block: &str) -> String {
    format!(
        r#"# Request

I am going to provide you with content from an invoice. I want you to analyze this content, extract relevant information, and return it as a JSON object.

# Extraction Guidelines

Below are the fields I want you to extract. Each one lists the key to use in your JSON response, the format of the JSON value, and examples of how the information may be labelled on the page. The examples are guidance, not an exhaustive list.

- If you are provided with page images along with the extracted excerpts, use the images only for context. Your extracted values must come exclusively from the extracted excerpts.

# Field Descriptions

{field_block}

# Final Notes

- If you cannot identify a field with confidence, exclude it from the JSON object.
- Never fill a missing field with a placeholder such as "N/A", "null", "Not Provided" or an empty string.
- If you cannot find **any** fields with confidence, return an empty JSON object like this: `{{}}`
- Do not add additional commentary
- Only return the JSON object in your response
"#,
        field_block = field_block.trim()
    )
}

fn render_extraction_task(field_descriptions: &str) -> String {
    format!(
        r#"# Identity

You are an invoice assistant that extracts information from invoices and returns the information in JSON format.

# Process

Your process for extracting invoice information is as follows:

1. You are provided with invoice content as text, as images, or as a combination of both
  - Text content is a set of excerpts extracted from the invoice
  - Image content is images of the extracted excerpts along with images of the invoice pages
  - Combined content is extracted text excerpts along with images of the invoice pages
2. You inspect the page images to understand the context of the extracted excerpts. You do not use the page images for anything else. The next steps focus on the extracted excerpts.
3. You carefully analyze the extracted excerpts for any of the following information:
{field_descriptions}
4. For each piece of information you find, you follow the formatting instructions provided to you to produce a JSON key-value pair
  - It is **critical** that you use the `Field` from your formatting instructions as the JSON key
  - If you cannot find a value, you exclude it from your response
    - You **do not** include the value as "Not Provided" or "null" or "N/A" or an empty string or anything like that
    - You exclude the value if it is null or empty
5. You construct a single JSON object from the key-value pairs you created
  - If you do not find relevant information in the invoice content, you return an empty JSON object: `{{}}`
  - You do not include information that appears only in the page images and not in the extracted excerpts
6. You return the JSON object, and **only** the JSON object, in your response
  - Your response is parsed as JSON, so any commentary or text outside the JSON object will break the parser

# Examples

## Example 1: nothing to extract

<invoice_text>
VERIZON
</invoice_text>

<assistant_response>
{{}}
</assistant_response>

## Example 2: text excerpt with page image context

<invoice_combined>
<invoice_surrounding_text>
VERIZON
</invoice_surrounding_text>
<invoice_image>
{{an image containing the following text:}}
ACCOUNT #
44575679
SRVC ADDR 152 Interstate Road           VERIZON, INC.
NOW DUE   DUE DATE    REMIT AFTER       1626 OAK STREET
                      DUE DATE          PO BOX 2107
1142.35   07/20/24    1153.77           LA CROSSE, WI 54602
</invoice_image>
</invoice_combined>

<assistant_response>
{{
  "account_number": "44575679",
  "amount_due": 1142.35,
  "due_date": "2024-07-20",
  "provider_name": "VERIZON, INC."
}}
</assistant_response>
"#,
        field_descriptions = field_descriptions.trim_end()
    )
}

/// Renders the QA prompt. Every key in `field_keys` is listed verbatim so the agent
/// keeps it unless it positively determines the value was extracted incorrectly.
pub fn render_qa_prompt(field_block: &str, extracted_record_json: &str, field_keys: &[String]) -> String {
    let keys: Vec<Value> = field_keys.iter().cloned().map(Value::String).collect();
    let key_list = render_json_list(&keys);

    format!(
        r#"# Identity

You are an AI QA agent tasked with evaluating the quality of extracted invoice information, correcting the extracted information when necessary, and returning the extracted information.

# Task

You have been provided with extracted invoice information, along with context and instructions regarding the extracted fields.

You have also been provided with the original images of the invoice. The images are the primary source of truth.

Your role is to analyze the extracted information, inspect the original invoice images, apply careful reasoning, determine whether the extracted information accurately represents the invoice, and share the final value you believe to be correct.

The extracted values may be incorrect or redundant. When they are, repair them and return the correct values in your response.

You return the final values as a JSON object where:
- each key is a field key, matching the key used in the extracted information
- each value is the value you determined to be correct after reviewing the entire invoice

You are provided with:

- **Extracted Information**: a JSON object where:
  - each key is an information field (you must re-use this key in your response)
  - each value is the value that was extracted from the invoice
- **Field Descriptions**: detailed descriptions of each field and instructions for identifying the correct values
- **Original Invoice Images**: images of the original invoice pages

# Objective

Review the information below, evaluate the values, review the invoice, correct the extracted values when appropriate, and return a JSON object representing the information in the invoice.

Always treat the information visible in the invoice images as the ultimate source of truth.

# Field Descriptions

Validate the following information for each field where it can be found, and correct it when necessary.

{field_block}

# Extracted Fields

Here is a JSON representation of the information that was extracted from the invoice. Evaluate it, inspect the invoice, and make any corrections necessary.

```json
{extracted_record_json}
```

# Process

For each field, follow these steps:

1. **Read the provided information and field descriptions** and guidelines.
2. **Analyze the extracted fields** provided as a JSON object.
3. **Correct values only if necessary** so the result accurately represents the invoice.
4. Double check that you are not forgetting any fields. You were provided with the following fields and you **must not** exclude them from your response **unless** you determine they were **incorrectly extracted**:
  - {key_list}
5. Return your response as a JSON object where:
  - each key is a field key, matching the key used in the extracted information
  - each value is the value you determined to be correct after reviewing the entire invoice
  - no value is left out of your response
6. If the extracted information is empty and the images contain none of the described fields, return an empty JSON object: `{{}}`

## Example

### Example Input Provided

```markdown
URLs for 2 pages of the invoice

# Extracted Fields

```json
{{ "account_number": "123", "amount_due": 95.0 }}
```
```

### Example Correct Response

```json
{{ "account_number": "456", "amount_due": 95.0 }}
```

### Example Explanation

- You analyzed the invoice images and found a number labelled "Customer ID" with a value of "123", a number labelled "Account ID" with a value of "456", and an unlabelled number "789"
  - You selected the account ID value "456" because it is more likely to be the unique account identifier
- You confirmed the amount due of 95.0 and kept it
- You returned every field in your response

# Instructions for your response

- Do not include explanations or reasoning steps in your output.
- Only provide your response JSON object.
- Do not add any commentary outside the JSON object.
"#,
        field_block = field_block.trim(),
        extracted_record_json = extracted_record_json.trim(),
        key_list = key_list,
    )
}

/// Renders the reconciliation prompt for `conflict_count` conflicted fields. Unlike QA,
/// the agent may drop a field entirely when none of its candidates is valid.
pub fn render_reconciliation_prompt(conflict_count: usize, conflict_block: &str) -> String {
    format!(
        r#"# Identity

You are an AI reconciliation agent tasked with resolving conflicting information extracted from invoices.

# Task

You have been provided with conflicting extracted values for {conflict_count} field(s) from an invoice, along with context and instructions regarding each field. The values were extracted by a document processing system and they disagree.

You have also been provided with the original images of the invoice. The images are the primary source of truth.

Your role is to analyze the conflicting values, inspect the original invoice images, apply careful reasoning, and determine the single correct value for each field. All of the values may be incorrect, in which case you must exclude the field from your response.

**Important**: if you determine none of the values are valid for a field, exclude it from your response. You **do not** have to select one of the conflicting values if all of them are incorrect.

You are provided with:

- **Field Descriptions**: detailed descriptions of each field and instructions for identifying the correct values
- **Conflicting Values**: lists of two or more conflicting extracted values for each field
- **Original Invoice Images**: images of the original invoice pages

# Objective

Review the provided information and return only the correct values in JSON format.

Always treat the information visible in the invoice images as the ultimate source of truth.

# Field Descriptions

{conflict_block}

# Process

For each field, follow these steps:

1. **Read the provided field description** and guidelines.
2. **Analyze each conflicting value using the original invoice images as the primary reference**:
  - Consider the typical formatting and usage patterns described in the field description.
  - Identify likely extraction errors, including common OCR misreads (character confusion such as 0/O, 1/l, 5/S), formatting errors and semantic misunderstandings.
  - Check logical coherence: date consistency, numerical plausibility, currency correctness and typical naming conventions.
3. **Rule out values** that are logically incorrect, implausible, or do not match the field description. Do not simply pick the value that appears most often.
4. **Select the single most accurate value** for each field.
  - If all of the values are incorrect, exclude the field from your response completely.
5. Return **only** the reconciled values formatted as a JSON object.
  - If no field can be reconciled, return an empty JSON object: `{{}}`

## Example

### Input Provided

```markdown
URLs for 2 pages of the invoice

# Field Descriptions

## Amount Due

Field:                  "amount_due"
Description:            numerical value representing the amount that the customer owes
Format:                 Number (float or int)
Example Identifiers:    "Now Due"
Conflicting Values:     ["897.25", "904.10"]

## Provider Name

Field:                  "provider_name"
Description:            name of the company that issued the statement or invoice and is owed payment from the customer
Format:                 string
Example Identifiers:    "Remit Payment"
Special Instructions:
- This is the provider that receives payment, not necessarily the provider who issues the bill
Conflicting Values:     ["John Doe", "Verizon", "John Doe"]
```

### Correct Response

```json
{{
  "amount_due": "897.25",
  "provider_name": "Verizon"
}}
```

### Explanation

- You analyzed the invoice images and found the amount due was 897.25 while the total amount billed was 904.10, so you selected 897.25
- You found that John Doe is the customer who pays and Verizon is the payee that should be sent the payment, so you selected Verizon even though "John Doe" was extracted more often

# Instructions for your response

- Do not include explanations or reasoning steps in your output.
- Only provide a single JSON object with the reconciled values.
- Do not add any commentary outside the JSON object.
"#,
        conflict_count = conflict_count,
        conflict_block = conflict_block.trim(),
    )
}

/// Note attached to the QA context when some content units never returned a fragment,
/// so the agent does not over-trust a record with missing coverage.
pub fn render_coverage_note(total_units: usize, failed_units: &[String]) -> Option<String> {
    if failed_units.is_empty() {
        return None;
    }

    let mut note = format!(
        "# Coverage Gaps\n\nExtraction failed for {} of {} content unit(s) of this invoice. \
         Fields that only appear in these units are missing from the extracted information, \
         so inspect the page images for them before concluding a field is absent.\n\n",
        failed_units.len(),
        total_units
    );
    for unit in failed_units {
        note.push_str(&format!("- {}\n", unit));
    }
    Some(note)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "## Amount Due\n\nField:                  \"amount_due\"\n";

    #[test]
    fn test_extraction_prompt_is_deterministic() {
        let a = render_extraction_prompt(BLOCK, "  - Amount Due: amount owed");
        let b = render_extraction_prompt(BLOCK, "  - Amount Due: amount owed");
        assert_eq!(a, b);
    }

    #[test]
    fn test_extraction_prompt_contract_language() {
        let prompts = render_extraction_prompt(BLOCK, "  - Amount Due: amount owed");

        assert!(prompts.request.contains("Field:                  \"amount_due\""));
        assert!(prompts.request.contains("return an empty JSON object like this: `{}`"));
        assert!(prompts.request.contains("Only return the JSON object"));
        assert!(prompts.request.contains("use the images only for context"));

        assert!(prompts.task.contains("# Identity"));
        assert!(prompts.task.contains("  - Amount Due: amount owed"));
        assert!(prompts.task.contains("<assistant_response>\n{}\n</assistant_response>"));
        assert!(prompts.task.contains("\"account_number\": \"44575679\""));
        assert!(prompts.task.contains("**only** the JSON object"));
    }

    #[test]
    fn test_qa_prompt_lists_every_key() {
        let keys = vec!["account_number".to_string(), "amount_due".to_string()];
        let prompt = render_qa_prompt(BLOCK, "{\n  \"amount_due\": 95.0\n}", &keys);

        for key in &keys {
            assert!(prompt.contains(key.as_str()));
        }
        assert!(prompt.contains("[\"account_number\", \"amount_due\"]"));
        assert!(prompt.contains("\"amount_due\": 95.0"));
        assert!(prompt.contains("ultimate source of truth"));
        assert!(prompt.contains("**unless** you determine they were **incorrectly extracted**"));
        assert!(prompt.contains("Do not add any commentary outside the JSON object."));
        assert!(prompt.contains("`{}`"));

        assert!(prompt.contains("a number labelled \"Customer ID\" with a value of \"123\""));
        assert!(prompt.contains("You selected the account ID value \"456\""));
        assert!(prompt.contains("{ \"account_number\": \"456\", \"amount_due\": 95.0 }"));

        assert_eq!(prompt, render_qa_prompt(BLOCK, "{\n  \"amount_due\": 95.0\n}", &keys));
    }

    #[test]
    fn test_qa_key_list_escapes_keys() {
        let keys = vec!["say \"hi\"".to_string(), r"back\slash".to_string()];
        let prompt = render_qa_prompt(BLOCK, "{}", &keys);
        assert!(prompt.contains(r#"  - ["say \"hi\"", "back\\slash"]"#));
    }

    #[test]
    fn test_reconciliation_prompt_embeds_count() {
        let prompt = render_reconciliation_prompt(3, BLOCK);
        assert!(prompt.contains("for 3 field(s)"));
        assert!(prompt.contains("exclude the field from your response completely"));
        assert!(prompt.contains("Do not add any commentary outside the JSON object."));
        assert!(prompt.contains("If no field can be reconciled, return an empty JSON object: `{}`"));
        assert!(prompt.contains("Do not simply pick the value that appears most often."));

        assert!(prompt.contains("Conflicting Values:     [\"John Doe\", \"Verizon\", \"John Doe\"]"));
        assert!(prompt.contains("\"provider_name\": \"Verizon\""));
        assert!(prompt.contains("even though \"John Doe\" was extracted more often"));
        assert!(prompt.contains("\"amount_due\": \"897.25\""));
        assert_eq!(prompt, render_reconciliation_prompt(3, BLOCK));
        assert_ne!(prompt, render_reconciliation_prompt(1, BLOCK));
    }

    #[test]
    fn test_coverage_note() {
        assert!(render_coverage_note(3, &[]).is_none());

        let note = render_coverage_note(3, &["unit-2 (table-figure)".to_string()]).unwrap();
        assert!(note.contains("1 of 3 content unit(s)"));
        assert!(note.contains("- unit-2 (table-figure)"));
    }
}

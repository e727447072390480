use gatehouse_contracts::Params;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static NATIONAL_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]{6})-([0-9]{7})").expect("national id pattern"));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\w.-]+@[\w.-]+\.\w+").expect("email pattern"));
static PHONE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(01[0-9])-?([0-9]{4})-?([0-9]{4})").expect("phone pattern"));
static CARD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9]{4})-([0-9]{4})-([0-9]{4})-([0-9]{4})").expect("card pattern")
});

/// Masks national ids, emails, mobile numbers and card numbers, in that
/// order. Later patterns see the output of earlier ones.
pub fn mask_pii(text: &str) -> String {
    let masked = NATIONAL_ID.replace_all(text, "${1}-*******");
    let masked = EMAIL.replace_all(&masked, "<EMAIL_MASKED>");
    let masked = PHONE.replace_all(&masked, "${1}-****-${3}");
    CARD.replace_all(&masked, "${1}-****-****-${4}")
        .into_owned()
}

/// Applies [`mask_pii`] to every top-level string value.
pub fn sanitize_params(params: &Params) -> Params {
    params
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(mask_pii(s)),
                other => other.clone(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Applies [`mask_pii`] to every string inside `value`, at any depth.
/// Object keys are left as they are.
pub fn mask_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(mask_pii(s)),
        Value::Array(items) => Value::Array(items.iter().map(mask_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

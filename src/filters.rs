/// Filter-processor collaborator: translates a raw querystring-style filter
/// map into predicates against a synthesized table, whitelisting field names
/// against the table's declared `filtering` list.
///
/// Unrecognized keys are dropped rather than rejected, so extra querystring
/// noise (pagination params, UTM tags) doesn't break listings.
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOp {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "contains" => Some(Self::Contains),
            _ => None,
        }
    }

    pub fn sql_operator(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            // Rendered with the backend's case-insensitive LIKE
            Self::Contains => "LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

/// Split a filter key into (field, operator): `population__gte` filters
/// `population >= value`, a bare key filters on equality.
fn parse_key(key: &str) -> (&str, FilterOp) {
    if let Some((field, suffix)) = key.rsplit_once("__") {
        if let Some(op) = FilterOp::from_suffix(suffix) {
            return (field, op);
        }
    }
    (key, FilterOp::Eq)
}

pub fn process(
    filtering: &BTreeMap<String, String>,
    allowed_fields: &[String],
) -> Vec<Filter> {
    filtering
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .filter_map(|(key, value)| {
            let (field, op) = parse_key(key.trim());
            let field = field.to_lowercase();
            allowed_fields
                .iter()
                .any(|allowed| allowed.trim_start_matches('-').to_lowercase() == field)
                .then(|| Filter {
                    field,
                    op,
                    value: value.clone(),
                })
        })
        .collect()
}

//! Value transforms available to templates and to explicit filter-chain
//! calls during argument rendering.
//!
//! Filters operate on `serde_json::Value` so the same table serves both the
//! minijinja environment (through thin adapters in the parent module) and
//! direct [`apply`] calls.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use md5::Md5;
use serde_json::Value as JsonValue;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use super::TemplateError;

/// Every filter name this library exposes.
pub const FILTER_NAMES: &[&str] = &[
    // String
    "upper", "lower", "title", "capitalize", "trim", "replace", "regex_replace",
    "regex_search", "regex_findall", "split", "join", "quote", "indent",
    // Numeric
    "int", "float", "abs", "round", "bool",
    // Sequence
    "length", "first", "last", "reverse", "sort", "unique", "flatten", "min", "max",
    "select", "reject", "selectattr", "map",
    // Mapping
    "combine", "dict2items", "items2dict", "keys", "values",
    // Hash / encoding
    "md5", "sha1", "sha256", "sha512", "hash", "b64encode", "b64decode",
    // Path
    "basename", "dirname", "expanduser",
    // Network
    "ipaddr", "ipv4", "ipv6", "ipwrap",
    // Type
    "to_json", "from_json", "to_yaml", "from_yaml", "default", "mandatory",
    "defined", "undefined",
    // Date
    "strftime", "to_datetime",
];

/// Apply the named filter to `value` with positional `args`.
pub fn apply(name: &str, value: &JsonValue, args: &[JsonValue]) -> Result<JsonValue, TemplateError> {
    let out = match name {
        // ==================================================================
        // String
        // ==================================================================
        "upper" => JsonValue::String(as_str(value).to_uppercase()),
        "lower" => JsonValue::String(as_str(value).to_lowercase()),
        "title" => JsonValue::String(title_case(&as_str(value))),
        "capitalize" => {
            let s = as_str(value);
            let mut chars = s.chars();
            let out = match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            };
            JsonValue::String(out)
        }
        "trim" => JsonValue::String(as_str(value).trim().to_string()),
        "replace" => {
            let old = str_arg(name, args, 0)?;
            let new = str_arg(name, args, 1)?;
            JsonValue::String(as_str(value).replace(&old, &new))
        }
        "regex_replace" => {
            let pattern = regex_arg(name, args, 0)?;
            let repl = str_arg(name, args, 1).unwrap_or_default();
            JsonValue::String(pattern.replace_all(&as_str(value), repl.as_str()).into_owned())
        }
        "regex_search" => {
            let pattern = regex_arg(name, args, 0)?;
            match pattern.find(&as_str(value)) {
                Some(m) => JsonValue::String(m.as_str().to_string()),
                None => JsonValue::Null,
            }
        }
        "regex_findall" => {
            let pattern = regex_arg(name, args, 0)?;
            let haystack = as_str(value);
            JsonValue::Array(
                pattern
                    .find_iter(&haystack)
                    .map(|m| JsonValue::String(m.as_str().to_string()))
                    .collect(),
            )
        }
        "split" => {
            let haystack = as_str(value);
            let parts: Vec<JsonValue> = match args.first() {
                Some(sep) => haystack
                    .split(&as_str(sep))
                    .map(|p| JsonValue::String(p.to_string()))
                    .collect(),
                None => haystack
                    .split_whitespace()
                    .map(|p| JsonValue::String(p.to_string()))
                    .collect(),
            };
            JsonValue::Array(parts)
        }
        "join" => {
            let sep = args.first().map(as_str).unwrap_or_default();
            let items = as_array(name, value)?;
            JsonValue::String(
                items.iter().map(as_str).collect::<Vec<_>>().join(&sep),
            )
        }
        "quote" => JsonValue::String(shell_words::quote(&as_str(value)).into_owned()),
        "indent" => {
            let width = args
                .first()
                .and_then(JsonValue::as_u64)
                .unwrap_or(4) as usize;
            let pad = " ".repeat(width);
            let s = as_str(value);
            let mut lines = s.lines();
            let mut out = String::new();
            if let Some(first) = lines.next() {
                out.push_str(first);
            }
            for line in lines {
                out.push('\n');
                if !line.is_empty() {
                    out.push_str(&pad);
                }
                out.push_str(line);
            }
            JsonValue::String(out)
        }

        // ==================================================================
        // Numeric
        // ==================================================================
        "int" => JsonValue::from(to_int(value)),
        "float" => JsonValue::from(to_float(value)),
        "abs" => match value {
            JsonValue::Number(n) if n.is_i64() => JsonValue::from(n.as_i64().unwrap().abs()),
            other => JsonValue::from(to_float(other).abs()),
        },
        "round" => {
            let precision = args.first().and_then(JsonValue::as_u64).unwrap_or(0) as i32;
            let factor = 10f64.powi(precision);
            let rounded = (to_float(value) * factor).round() / factor;
            if precision == 0 {
                JsonValue::from(rounded as i64)
            } else {
                JsonValue::from(rounded)
            }
        }
        "bool" => JsonValue::Bool(to_bool(value)),

        // ==================================================================
        // Sequence
        // ==================================================================
        "length" => match value {
            JsonValue::Array(a) => JsonValue::from(a.len()),
            JsonValue::Object(o) => JsonValue::from(o.len()),
            JsonValue::String(s) => JsonValue::from(s.chars().count()),
            _ => return Err(TemplateError::filter(name, "value has no length")),
        },
        "first" => as_array(name, value)?.first().cloned().unwrap_or(JsonValue::Null),
        "last" => as_array(name, value)?.last().cloned().unwrap_or(JsonValue::Null),
        "reverse" => {
            let mut items = as_array(name, value)?.to_vec();
            items.reverse();
            JsonValue::Array(items)
        }
        "sort" => {
            let mut items = as_array(name, value)?.to_vec();
            items.sort_by(compare_values);
            JsonValue::Array(items)
        }
        "unique" => {
            let items = as_array(name, value)?;
            let mut seen = Vec::new();
            let mut out = Vec::new();
            for item in items {
                let key = item.to_string();
                if !seen.contains(&key) {
                    seen.push(key);
                    out.push(item.clone());
                }
            }
            JsonValue::Array(out)
        }
        "flatten" => {
            let depth = args.first().and_then(JsonValue::as_u64).map(|d| d as usize);
            let items = as_array(name, value)?;
            let mut out = Vec::new();
            flatten_into(items, depth, &mut out);
            JsonValue::Array(out)
        }
        "min" => as_array(name, value)?
            .iter()
            .min_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(JsonValue::Null),
        "max" => as_array(name, value)?
            .iter()
            .max_by(|a, b| compare_values(a, b))
            .cloned()
            .unwrap_or(JsonValue::Null),
        "select" => {
            let items = as_array(name, value)?;
            JsonValue::Array(items.iter().filter(|v| truthy(v)).cloned().collect())
        }
        "reject" => {
            let items = as_array(name, value)?;
            JsonValue::Array(items.iter().filter(|v| !truthy(v)).cloned().collect())
        }
        "selectattr" => {
            let attr = str_arg(name, args, 0)?;
            let items = as_array(name, value)?;
            let filtered: Vec<JsonValue> = match (args.get(1).map(as_str).as_deref(), args.get(2)) {
                (Some("equalto"), Some(expected)) => items
                    .iter()
                    .filter(|item| attr_of(item, &attr).map(|v| v == *expected).unwrap_or(false))
                    .cloned()
                    .collect(),
                (Some("defined"), _) => items
                    .iter()
                    .filter(|item| attr_of(item, &attr).is_some())
                    .cloned()
                    .collect(),
                _ => items
                    .iter()
                    .filter(|item| attr_of(item, &attr).map(|v| truthy(&v)).unwrap_or(false))
                    .cloned()
                    .collect(),
            };
            JsonValue::Array(filtered)
        }
        "map" => {
            let attr = str_arg(name, args, 0)?;
            let items = as_array(name, value)?;
            JsonValue::Array(
                items
                    .iter()
                    .map(|item| attr_of(item, &attr).unwrap_or(JsonValue::Null))
                    .collect(),
            )
        }

        // ==================================================================
        // Mapping
        // ==================================================================
        "combine" => {
            let mut merged = value.clone();
            for arg in args {
                merged = crate::vars::merge_values(&merged, arg);
            }
            merged
        }
        "dict2items" => {
            let map = as_object(name, value)?;
            JsonValue::Array(
                map.iter()
                    .map(|(k, v)| {
                        serde_json::json!({ "key": k, "value": v })
                    })
                    .collect(),
            )
        }
        "items2dict" => {
            let items = as_array(name, value)?;
            let mut map = serde_json::Map::new();
            for item in items {
                let obj = item
                    .as_object()
                    .ok_or_else(|| TemplateError::filter(name, "items must be mappings"))?;
                let key = obj
                    .get("key")
                    .map(as_str)
                    .ok_or_else(|| TemplateError::filter(name, "item missing 'key'"))?;
                let val = obj.get("value").cloned().unwrap_or(JsonValue::Null);
                map.insert(key, val);
            }
            JsonValue::Object(map)
        }
        "keys" => {
            let map = as_object(name, value)?;
            JsonValue::Array(map.keys().map(|k| JsonValue::String(k.clone())).collect())
        }
        "values" => {
            let map = as_object(name, value)?;
            JsonValue::Array(map.values().cloned().collect())
        }

        // ==================================================================
        // Hash / encoding
        // ==================================================================
        "md5" => JsonValue::String(hex_digest::<Md5>(&as_str(value))),
        "sha1" => JsonValue::String(hex_digest::<Sha1>(&as_str(value))),
        "sha256" => JsonValue::String(hex_digest::<Sha256>(&as_str(value))),
        "sha512" => JsonValue::String(hex_digest::<Sha512>(&as_str(value))),
        "hash" => {
            let algo = args.first().map(as_str).unwrap_or_else(|| "sha1".into());
            let input = as_str(value);
            let digest = match algo.as_str() {
                "md5" => hex_digest::<Md5>(&input),
                "sha1" => hex_digest::<Sha1>(&input),
                "sha256" => hex_digest::<Sha256>(&input),
                "sha512" => hex_digest::<Sha512>(&input),
                other => {
                    return Err(TemplateError::filter(
                        name,
                        format!("unknown hash algorithm '{}'", other),
                    ))
                }
            };
            JsonValue::String(digest)
        }
        "b64encode" => JsonValue::String(BASE64.encode(as_str(value).as_bytes())),
        "b64decode" => {
            let decoded = BASE64
                .decode(as_str(value).as_bytes())
                .map_err(|e| TemplateError::filter(name, e.to_string()))?;
            JsonValue::String(
                String::from_utf8(decoded)
                    .map_err(|_| TemplateError::filter(name, "decoded bytes are not UTF-8"))?,
            )
        }

        // ==================================================================
        // Path
        // ==================================================================
        "basename" => {
            let s = as_str(value);
            JsonValue::String(
                Path::new(&s)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        }
        "dirname" => {
            let s = as_str(value);
            JsonValue::String(
                Path::new(&s)
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            )
        }
        "expanduser" => {
            JsonValue::String(shellexpand::tilde(&as_str(value)).into_owned())
        }

        // ==================================================================
        // Network
        // ==================================================================
        "ipaddr" => match parse_ip_like(&as_str(value)) {
            Some(canonical) => JsonValue::String(canonical),
            None => JsonValue::Bool(false),
        },
        "ipv4" => match as_str(value).parse::<Ipv4Addr>() {
            Ok(addr) => JsonValue::String(addr.to_string()),
            Err(_) => JsonValue::Bool(false),
        },
        "ipv6" => match as_str(value).parse::<Ipv6Addr>() {
            Ok(addr) => JsonValue::String(addr.to_string()),
            Err(_) => JsonValue::Bool(false),
        },
        "ipwrap" => {
            let s = as_str(value);
            if s.parse::<Ipv6Addr>().is_ok() {
                JsonValue::String(format!("[{}]", s))
            } else {
                JsonValue::String(s)
            }
        }

        // ==================================================================
        // Type
        // ==================================================================
        "to_json" => {
            let pretty = args.first().map(to_bool).unwrap_or(false);
            let rendered = if pretty {
                serde_json::to_string_pretty(value)
            } else {
                serde_json::to_string(value)
            }
            .map_err(|e| TemplateError::filter(name, e.to_string()))?;
            JsonValue::String(rendered)
        }
        "from_json" => serde_json::from_str(&as_str(value))
            .map_err(|e| TemplateError::filter(name, e.to_string()))?,
        "to_yaml" => JsonValue::String(
            serde_yaml::to_string(value).map_err(|e| TemplateError::filter(name, e.to_string()))?,
        ),
        "from_yaml" => serde_yaml::from_str(&as_str(value))
            .map_err(|e| TemplateError::filter(name, e.to_string()))?,
        "default" => {
            if value.is_null() || matches!(value, JsonValue::String(s) if s.is_empty()) {
                args.first().cloned().unwrap_or(JsonValue::Null)
            } else {
                value.clone()
            }
        }
        "mandatory" => {
            if value.is_null() {
                let msg = args
                    .first()
                    .map(as_str)
                    .unwrap_or_else(|| "mandatory value is undefined".into());
                return Err(TemplateError::filter(name, msg));
            }
            value.clone()
        }
        "defined" => JsonValue::Bool(!value.is_null()),
        "undefined" => JsonValue::Bool(value.is_null()),

        // ==================================================================
        // Date
        // ==================================================================
        "strftime" => {
            let fmt = str_arg(name, args, 0)?;
            let dt = to_datetime(value)
                .ok_or_else(|| TemplateError::filter(name, "value is not a timestamp"))?;
            JsonValue::String(dt.format(&fmt).to_string())
        }
        "to_datetime" => {
            let s = as_str(value);
            let dt = match args.first().map(as_str) {
                Some(fmt) => NaiveDateTime::parse_from_str(&s, &fmt)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .map_err(|e| TemplateError::filter(name, e.to_string()))?,
                None => parse_datetime_lenient(&s)
                    .ok_or_else(|| TemplateError::filter(name, "unrecognized datetime"))?,
            };
            JsonValue::String(dt.format("%Y-%m-%d %H:%M:%S").to_string())
        }

        other => return Err(TemplateError::UnknownFilter(other.to_string())),
    };
    Ok(out)
}

fn as_str(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_array<'v>(filter: &str, value: &'v JsonValue) -> Result<&'v Vec<JsonValue>, TemplateError> {
    value
        .as_array()
        .ok_or_else(|| TemplateError::filter(filter, "value is not a sequence"))
}

fn as_object<'v>(
    filter: &str,
    value: &'v JsonValue,
) -> Result<&'v serde_json::Map<String, JsonValue>, TemplateError> {
    value
        .as_object()
        .ok_or_else(|| TemplateError::filter(filter, "value is not a mapping"))
}

fn str_arg(filter: &str, args: &[JsonValue], idx: usize) -> Result<String, TemplateError> {
    args.get(idx)
        .map(as_str)
        .ok_or_else(|| TemplateError::filter(filter, format!("missing argument {}", idx + 1)))
}

fn regex_arg(filter: &str, args: &[JsonValue], idx: usize) -> Result<regex::Regex, TemplateError> {
    let pattern = str_arg(filter, args, idx)?;
    regex::Regex::new(&pattern).map_err(|e| TemplateError::filter(filter, e.to_string()))
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn to_int(value: &JsonValue) -> i64 {
    match value {
        JsonValue::Number(n) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .or_else(|_| s.trim().parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        JsonValue::Bool(b) => *b as i64,
        _ => 0,
    }
}

fn to_float(value: &JsonValue) -> f64 {
    match value {
        JsonValue::Number(n) => n.as_f64().unwrap_or(0.0),
        JsonValue::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        JsonValue::Bool(b) => *b as i64 as f64,
        _ => 0.0,
    }
}

fn to_bool(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        _ => false,
    }
}

fn truthy(value: &JsonValue) -> bool {
    crate::executor::condition::is_truthy(value)
}

fn attr_of(item: &JsonValue, attr: &str) -> Option<JsonValue> {
    let mut current = item.clone();
    for segment in attr.split('.') {
        current = current.as_object()?.get(segment)?.clone();
    }
    Some(current)
}

fn compare_values(a: &JsonValue, b: &JsonValue) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => as_str(a).cmp(&as_str(b)),
    }
}

fn flatten_into(items: &[JsonValue], depth: Option<usize>, out: &mut Vec<JsonValue>) {
    for item in items {
        match item {
            JsonValue::Array(inner) if depth != Some(0) => {
                flatten_into(inner, depth.map(|d| d - 1), out);
            }
            other => out.push(other.clone()),
        }
    }
}

fn hex_digest<D: Digest>(input: &str) -> String {
    let mut hasher = D::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_ip_like(s: &str) -> Option<String> {
    if let Ok(addr) = s.parse::<IpAddr>() {
        return Some(addr.to_string());
    }
    // CIDR form: address/prefix.
    let (addr, prefix) = s.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    (prefix <= max).then(|| format!("{}/{}", addr, prefix))
}

fn to_datetime(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::Number(n) => Utc.timestamp_opt(n.as_i64()?, 0).single(),
        JsonValue::String(s) => parse_datetime_lenient(s),
        _ => None,
    }
}

fn parse_datetime_lenient(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(epoch) = s.trim().parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(date) = chrono::NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

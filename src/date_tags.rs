//! # Filename date-tag expansion
//!
//! Model I/O filenames are derived from templates carrying bracketed date tags in the three
//! conventional forms, with an optional whole-day offset modifier:
//!
//! ```text
//! emis.<YYYYMMDD>.json          → emis.20190704.json
//! conc.<YYYYDDD>.json           → conc.2019185.json
//! force.<YYYY-MM-DD#+1>.json    → force.2019-07-05.json
//! ```
//!
//! A single expander, [`expand_date_tags`], covers all three forms plus offsets and is
//! reused for every filename derivation in the crate.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::data::domain::ModelDate;
use crate::errors::FourdvarError;

static TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<(YYYYMMDD|YYYYDDD|YYYY-MM-DD)(?:#([+-]\d+))?>").expect("date tag regex")
});

/// Replace every bracketed date tag in `template` with the formatted `date`.
///
/// Arguments
/// -----------------
/// * `template`: filename template, e.g. `"emis.<YYYYMMDD#+1>.json"`.
/// * `date`: the reference date; offset modifiers shift it by whole days.
///
/// Return
/// ----------
/// * The expanded string, or a [`FourdvarError::DateTag`] if the template contains a
///   malformed bracketed tag.
pub fn expand_date_tags(template: &str, date: ModelDate) -> Result<String, FourdvarError> {
    // Reject look-alike tags the regex does not match, e.g. a bad offset sign.
    if let Some(open) = unmatched_tag(template) {
        return Err(FourdvarError::DateTag(format!(
            "malformed date tag near {open:?} in template {template:?}"
        )));
    }
    let out = TAG_RE.replace_all(template, |caps: &regex::Captures<'_>| {
        let offset: i64 = caps
            .get(2)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);
        let d = date.add_days(offset);
        match &caps[1] {
            "YYYYMMDD" => d.ymd8(),
            "YYYYDDD" => d.yd7(),
            _ => d.iso(),
        }
    });
    Ok(out.into_owned())
}

/// First `<...>` group that is not a valid date tag, if any.
fn unmatched_tag(template: &str) -> Option<&str> {
    let mut rest = template;
    while let Some(start) = rest.find('<') {
        let tail = &rest[start..];
        let end = tail.find('>')? + 1;
        let group = &tail[..end];
        if !TAG_RE.is_match(group) {
            return Some(group);
        }
        rest = &tail[end..];
    }
    None
}

//! Table-driven fixes for software that reports its fields in odd shapes.
//!
//! Each [`Sanitizer`] matches on the bundle identifier or the name and then
//! rewrites fields of the matching entry. Sanitizers never look at anything
//! besides the entry itself.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::Software;

/// What a sanitizer keys on.
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    BundleIdentifier(&'static str),
    Name(&'static str),
}

impl Matcher {
    fn matches(&self, software: &Software) -> bool {
        match self {
            Matcher::BundleIdentifier(id) => software.bundle_identifier == *id,
            Matcher::Name(name) => software.name == *name,
        }
    }
}

pub struct Sanitizer {
    pub name: &'static str,
    pub matcher: Matcher,
    pub apply: fn(&mut Software),
}

static DCV_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+\.\d+) \(r(\d+)\)$").expect("valid DCV version pattern"));

/// `2023.1 (r16388)` → `2023.1.16388`
fn dcv_viewer_version(software: &mut Software) {
    if let Some(caps) = DCV_VERSION.captures(&software.version) {
        software.version = format!("{}.{}", &caps[1], &caps[2]);
    }
}

pub static SANITIZERS: &[Sanitizer] = &[
    Sanitizer {
        name: "dcv_viewer_version_bundle",
        matcher: Matcher::BundleIdentifier("com.nicesoftware.dcvviewer"),
        apply: dcv_viewer_version,
    },
    Sanitizer {
        name: "dcv_viewer_version_name",
        matcher: Matcher::Name("DCV Viewer"),
        apply: dcv_viewer_version,
    },
];

/// Run every matching sanitizer over `software`, in table order.
pub fn sanitize(software: &mut Software) {
    for sanitizer in SANITIZERS {
        if sanitizer.matcher.matches(software) {
            (sanitizer.apply)(software);
        }
    }
}

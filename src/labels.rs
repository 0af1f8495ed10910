//! Label policy enforcement (spec §6 "Labels applied to containers",
//! SPEC_FULL §B). Standalone so the reserved-namespace invariant has one
//! place to be tested, rather than being inlined string concatenation.

use std::collections::HashMap;

use glob::Pattern;

use crate::task::spec::TaskSpec;

pub const ALLOC_ID_LABEL: &str = "com.hashicorp.nomad.alloc_id";
const RESERVED_PREFIX: &str = "com.hashicorp.nomad.";

/// Build the final label set for a container: the mandatory alloc-id
/// label, plus any opt-in labels matching `extra_label_globs`, with
/// user-supplied labels forbidden from overriding the reserved namespace.
pub fn build(spec: &TaskSpec, extra_label_globs: &[String]) -> HashMap<String, String> {
    let mut labels = HashMap::new();

    for (k, v) in &spec.labels {
        if k.starts_with(RESERVED_PREFIX) {
            continue;
        }
        labels.insert(k.clone(), v.clone());
    }

    for candidate in opt_in_candidates(spec) {
        if matches_any(&candidate.0, extra_label_globs) {
            labels.insert(candidate.0, candidate.1);
        }
    }

    labels.insert(ALLOC_ID_LABEL.to_string(), spec.alloc_id.clone());
    labels
}

fn opt_in_candidates(spec: &TaskSpec) -> Vec<(String, String)> {
    let mut out = vec![("task_name".to_string(), spec.task_name.clone())];
    if let Some(group) = &spec.task_group_name {
        out.push(("task_group_name".to_string(), group.clone()));
    }
    if let Some(job) = &spec.job_name {
        out.push(("job_name".to_string(), job.clone()));
    }
    out
}

fn matches_any(key: &str, globs: &[String]) -> bool {
    globs
        .iter()
        .filter_map(|g| Pattern::new(g).ok())
        .any(|p| p.matches(key))
}

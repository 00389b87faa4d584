// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Capability fan-out.
//!
//! Turns one multi-method, multi-sample [`Submission`] into a
//! [`SubmissionPlan`]: one [`CapabilityGroup`] per capability, each carrying
//! the sample-test rows it will own. Planning is pure; the persistence
//! backend allocates numbers and writes the plan in a single transaction.
//!
//! Row expansion for one method:
//!
//! ```text
//! selected, samples [s1, s2]          → s1_{code}_R1, s2_{code}_R1
//! + instance #1, samples [s1]         → s1_{code}_R2
//! + instance #2, samples [s2]         → s2_{code}_R3
//! ```
//!
//! An unselected method with instances starts its instances at `R1`.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::warn;

use crate::error::CoreError;
use crate::model::{Priority, SampleInput, Submission, TestMethodInput};
use crate::persistence::CapabilityRecord;

/// A sample-test row to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSampleTest {
    /// Sample the row is for.
    pub sample_name: String,
    /// `{sample}_{methodCode}_R{repeat_index}`.
    pub full_sample_name: String,
    /// Catalogue id of the method, if supplied.
    pub method_id: Option<String>,
    /// Method code.
    pub method_code: String,
    /// 1-based run number of the method within its request.
    pub repeat_index: i32,
    /// Requirements for this run.
    pub requirements: Option<String>,
}

/// Methods of one capability and the rows they expand to.
#[derive(Debug, Clone)]
pub struct CapabilityGroup {
    /// Resolved capability.
    pub capability: CapabilityRecord,
    /// Methods assigned to this capability, in submission order.
    pub test_methods: Vec<TestMethodInput>,
    /// Rows to create under this group's request.
    pub sample_tests: Vec<PlannedSampleTest>,
}

/// A method left out of every request, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedMethod {
    /// Method code as submitted.
    pub method_code: String,
    /// Catalogue id, if supplied.
    pub method_id: Option<String>,
    /// Why it was left out.
    pub reason: String,
}

/// Everything needed to persist one submission.
#[derive(Debug, Clone)]
pub struct SubmissionPlan {
    pub submission_id: Option<String>,
    pub priority: Priority,
    pub requester_name: String,
    pub requester_email: Option<String>,
    pub cost_center: Option<String>,
    /// Shared verbatim by every group's request.
    pub samples: Vec<SampleInput>,
    /// One entry per capability, in first-appearance order.
    pub groups: Vec<CapabilityGroup>,
    /// Methods that could not be assigned to a capability.
    pub rejected: Vec<RejectedMethod>,
}

impl SubmissionPlan {
    /// Non-urgent requests are approved on submission.
    pub fn is_approved(&self) -> bool {
        self.priority != Priority::Urgent
    }

    /// Total number of sample-test rows across all groups.
    pub fn sample_test_count(&self) -> usize {
        self.groups.iter().map(|g| g.sample_tests.len()).sum()
    }
}

fn active_methods(submission: &Submission) -> impl Iterator<Item = &TestMethodInput> {
    submission.test_methods.iter().filter(|m| !m.is_deleted)
}

fn capability_ref(method: &TestMethodInput) -> Option<&str> {
    method
        .capability_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// Reject submissions that cannot produce any row.
pub fn validate_submission(submission: &Submission) -> Result<(), CoreError> {
    if submission.requester_name.trim().is_empty() {
        return Err(CoreError::validation(
            "requesterName",
            "Requester name is required",
        ));
    }

    if submission.test_methods.is_empty() {
        return Err(CoreError::validation(
            "testMethods",
            "No test methods provided",
        ));
    }

    if !active_methods(submission).any(TestMethodInput::is_requested) {
        return Err(CoreError::validation("testMethods", "No methods selected"));
    }

    let mut sample_names = HashSet::with_capacity(submission.samples.len());
    for sample in &submission.samples {
        if !sample_names.insert(sample.generated_name.as_str()) {
            return Err(CoreError::validation(
                "samples",
                format!("Duplicate sample name '{}'", sample.generated_name),
            ));
        }
    }

    for method in active_methods(submission) {
        let main = method.selected.then_some(method.samples.as_slice());
        let lists = main
            .into_iter()
            .chain(method.instances.iter().map(|i| i.samples.as_slice()));

        // A list becomes one repeat, so a name may appear in it only once.
        for list in lists {
            let mut listed = HashSet::with_capacity(list.len());
            for name in list {
                if !sample_names.contains(name.as_str()) {
                    return Err(CoreError::validation(
                        "samples",
                        format!(
                            "Sample '{}' referenced by method '{}' is not part of the submission",
                            name, method.method_code
                        ),
                    ));
                }
                if !listed.insert(name.as_str()) {
                    return Err(CoreError::validation(
                        "samples",
                        format!(
                            "Sample '{}' is listed twice for method '{}'",
                            name, method.method_code
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Distinct capability ids referenced by non-deleted methods, in order.
pub fn referenced_capabilities(submission: &Submission) -> Vec<String> {
    let mut seen = HashSet::new();
    active_methods(submission)
        .filter_map(capability_ref)
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Partition a submission by capability and expand every group's rows.
///
/// `capabilities` maps capability id to its record; methods whose
/// capability is missing from the map are rejected.
pub fn plan_submission(
    submission: &Submission,
    capabilities: &HashMap<String, CapabilityRecord>,
) -> Result<SubmissionPlan, CoreError> {
    validate_submission(submission)?;

    let mut groups: Vec<CapabilityGroup> = Vec::new();
    let mut group_index: HashMap<&str, usize> = HashMap::new();
    let mut rejected = Vec::new();

    for method in active_methods(submission) {
        let Some(capability_id) = capability_ref(method) else {
            warn!(method_code = %method.method_code, "Dropping method without capability");
            rejected.push(RejectedMethod {
                method_code: method.method_code.clone(),
                method_id: method.id.clone(),
                reason: "method has no capability".to_string(),
            });
            continue;
        };

        let Some(capability) = capabilities.get(capability_id) else {
            warn!(
                method_code = %method.method_code,
                capability_id,
                "Dropping method with unknown capability"
            );
            rejected.push(RejectedMethod {
                method_code: method.method_code.clone(),
                method_id: method.id.clone(),
                reason: format!("capability '{}' not found", capability_id),
            });
            continue;
        };

        let idx = *group_index.entry(capability_id).or_insert_with(|| {
            groups.push(CapabilityGroup {
                capability: capability.clone(),
                test_methods: Vec::new(),
                sample_tests: Vec::new(),
            });
            groups.len() - 1
        });
        groups[idx].test_methods.push(method.clone());
    }

    if groups.is_empty() {
        return Err(CoreError::validation(
            "testMethods",
            "No valid methods with capability",
        ));
    }

    for group in &mut groups {
        group.sample_tests = expand_sample_tests(&group.test_methods);
    }

    Ok(SubmissionPlan {
        submission_id: submission.submission_id.clone(),
        priority: submission.priority,
        requester_name: submission.requester_name.trim().to_string(),
        requester_email: submission.requester_email.clone(),
        cost_center: submission.cost_center.clone(),
        samples: submission.samples.clone(),
        groups,
        rejected,
    })
}

/// Expand the methods of one group into sample-test rows.
///
/// Repeat indexes are counted per method code, so the same code submitted
/// twice in a group continues numbering instead of colliding.
pub fn expand_sample_tests(methods: &[TestMethodInput]) -> Vec<PlannedSampleTest> {
    let mut last_index: HashMap<&str, i32> = HashMap::new();
    let mut rows = Vec::new();

    for method in methods {
        let index = last_index.entry(method.method_code.as_str()).or_insert(0);

        if method.selected {
            *index += 1;
            for sample in &method.samples {
                rows.push(planned_row(method, sample, *index, &method.requirements));
            }
        }

        for instance in &method.instances {
            *index += 1;
            for sample in &instance.samples {
                rows.push(planned_row(method, sample, *index, &instance.requirements));
            }
        }
    }

    rows
}

fn planned_row(
    method: &TestMethodInput,
    sample: &str,
    repeat_index: i32,
    requirements: &Option<String>,
) -> PlannedSampleTest {
    PlannedSampleTest {
        sample_name: sample.to_string(),
        full_sample_name: format!("{}_{}_R{}", sample, method.method_code, repeat_index),
        method_id: method.id.clone(),
        method_code: method.method_code.clone(),
        repeat_index,
        requirements: requirements.clone(),
    }
}

// Copyright (c) The testrelay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The set of tests declared by a launch, keyed by name.

use crate::{
    errors::RegistryError,
    protocol::{CacheStatus, RunInfo, TestDescriptor},
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::collections::HashSet;

/// A declared test and what is known about its execution so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestNode {
    name: String,
    parents: Vec<String>,
    cache_status: CacheStatus,
    source_file: Utf8PathBuf,
    last_run: Option<RunInfo>,
    output: String,
}

impl TestNode {
    fn new(descriptor: TestDescriptor) -> Self {
        Self {
            name: descriptor.name,
            parents: descriptor.parents,
            cache_status: descriptor.cache_status,
            source_file: descriptor.source_file,
            last_run: None,
            output: String::new(),
        }
    }

    /// The name of the test.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The names of the tests this one depends on.
    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    /// The cache status declared at launch.
    pub fn cache_status(&self) -> CacheStatus {
        self.cache_status
    }

    /// Returns true if a previous result for this test is still valid.
    pub fn is_cached(&self) -> bool {
        self.cache_status == CacheStatus::Ok
    }

    /// The definition file the test was declared in.
    pub fn source_file(&self) -> &Utf8Path {
        &self.source_file
    }

    /// The most recent run snapshot, if the test has started.
    pub fn last_run(&self) -> Option<&RunInfo> {
        self.last_run.as_ref()
    }

    /// Output accumulated since the test last started.
    pub fn output(&self) -> &str {
        &self.output
    }
}

/// All tests in a launch, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct TestRegistry {
    nodes: IndexMap<String, TestNode>,
}

impl TestRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every declared test.
    ///
    /// Either all tests are registered or, if any name is duplicated (within `tests` or against
    /// a test that's already registered), none are.
    pub fn register_all(&mut self, tests: Vec<TestDescriptor>) -> Result<(), RegistryError> {
        let mut seen = HashSet::with_capacity(tests.len());
        for test in &tests {
            if self.nodes.contains_key(&test.name) || !seen.insert(test.name.as_str()) {
                return Err(RegistryError::DuplicateTest {
                    name: test.name.clone(),
                });
            }
        }

        self.nodes.reserve(tests.len());
        for test in tests {
            self.nodes.insert(test.name.clone(), TestNode::new(test));
        }
        Ok(())
    }

    /// Looks up a test by name.
    pub fn get(&self, name: &str) -> Result<&TestNode, RegistryError> {
        self.nodes
            .get(name)
            .ok_or_else(|| RegistryError::UnknownTest {
                name: name.to_owned(),
            })
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut TestNode, RegistryError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownTest {
                name: name.to_owned(),
            })
    }

    /// Records that a test started (or started being skipped), and clears its output.
    pub fn mark_begin(&mut self, run: &RunInfo) -> Result<(), RegistryError> {
        let node = self.get_mut(&run.test_name)?;
        node.last_run = Some(run.clone());
        node.output.clear();
        Ok(())
    }

    /// Records that a test finished.
    pub fn mark_end(&mut self, run: &RunInfo) -> Result<(), RegistryError> {
        let node = self.get_mut(&run.test_name)?;
        node.last_run = Some(run.clone());
        Ok(())
    }

    /// Appends text to a test's output.
    pub fn append_output(&mut self, name: &str, text: &str) -> Result<(), RegistryError> {
        self.get_mut(name)?.output.push_str(text);
        Ok(())
    }

    /// The number of registered tests.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no tests are registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over tests in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &TestNode> + '_ {
        self.nodes.values()
    }
}


#[cfg(test)]
mod tests {
    use super::{test_helpers::*, *};
    use crate::protocol::ExecStatus;
    use pretty_assertions::assert_eq;

    #[test]
    fn register_preserves_declaration_order() {
        let mut registry = TestRegistry::new();
        registry
            .register_all(vec![
                descriptor("b", &[], "x.testo"),
                cached(descriptor("a", &["b"], "x.testo")),
            ])
            .expect("registration succeeds");

        let names: Vec<_> = registry.iter().map(TestNode::name).collect();
        assert_eq!(names, ["b", "a"]);
        assert!(registry.get("a").unwrap().is_cached());
        assert_eq!(registry.get("a").unwrap().parents(), ["b"]);
        assert_eq!(registry.get("a").unwrap().last_run(), None);
    }

    #[test]
    fn duplicate_registration_is_atomic() {
        let mut registry = TestRegistry::new();
        let err = registry
            .register_all(vec![
                descriptor("a", &[], "x.testo"),
                descriptor("b", &[], "x.testo"),
                descriptor("a", &[], "y.testo"),
            ])
            .expect_err("duplicate is rejected");

        assert_eq!(
            err,
            RegistryError::DuplicateTest {
                name: "a".to_owned()
            }
        );
        assert!(registry.is_empty());

        registry
            .register_all(vec![descriptor("a", &[], "x.testo")])
            .unwrap();
        assert_eq!(
            registry.register_all(vec![descriptor("a", &[], "x.testo")]),
            Err(RegistryError::DuplicateTest {
                name: "a".to_owned()
            })
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn begin_clears_output_and_end_keeps_it() {
        let mut registry = TestRegistry::new();
        registry
            .register_all(vec![descriptor("a", &[], "x.testo")])
            .unwrap();

        registry
            .mark_begin(&RunInfo::new("a", ExecStatus::Unknown))
            .unwrap();
        registry.append_output("a", "line 1\n").unwrap();
        registry.append_output("a", "line 2\n").unwrap();
        registry
            .mark_end(&RunInfo::new("a", ExecStatus::Passed))
            .unwrap();

        let node = registry.get("a").unwrap();
        assert_eq!(node.output(), "line 1\nline 2\n");
        assert_eq!(
            node.last_run(),
            Some(&RunInfo::new("a", ExecStatus::Passed))
        );

        // A rerun starts with fresh output.
        registry
            .mark_begin(&RunInfo::new("a", ExecStatus::Unknown))
            .unwrap();
        assert_eq!(registry.get("a").unwrap().output(), "");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let mut registry = TestRegistry::new();
        let unknown = RegistryError::UnknownTest {
            name: "ghost".to_owned(),
        };

        assert_eq!(registry.get("ghost").unwrap_err(), unknown);
        assert_eq!(
            registry.mark_begin(&RunInfo::new("ghost", ExecStatus::Unknown)),
            Err(unknown.clone())
        );
        assert_eq!(
            registry.mark_end(&RunInfo::new("ghost", ExecStatus::Passed)),
            Err(unknown.clone())
        );
        assert_eq!(registry.append_output("ghost", "text"), Err(unknown));
    }
}

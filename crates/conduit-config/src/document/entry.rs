//! Entry registry: the declared shape of every key in a pipeline document.
//!
//! Each `Entry` is a static table row describing a value's shape, its
//! declared children and an optional semantic check. Nodes look their
//! entries up by key while the tree is built.

use super::checks;
use super::node::{ConfigNode, Findings, ValidationContext};

/// Semantic check run after a node's shape has been accepted.
pub type Check = fn(&ConfigNode, &ValidationContext, &mut Findings);

/// Scalar value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    String,
    Boolean,
    Integer,
    /// An integer or an array of integers.
    IntegerList,
    /// Integer seconds or a human-readable duration string.
    Duration,
    /// A rule or job outcome token.
    When,
    /// A string or an array of strings.
    StringList,
    /// A string or a nested array of strings.
    Script,
    /// A string, number or boolean; normalized to a string.
    VariableValue,
    /// A boolean or a duration.
    CacheFlag,
}

impl ScalarKind {
    pub fn describe(&self) -> &'static str {
        match self {
            ScalarKind::String => "a string",
            ScalarKind::Boolean => "a boolean value",
            ScalarKind::Integer => "an integer",
            ScalarKind::IntegerList => "an integer or an array of integers",
            ScalarKind::Duration => "a duration",
            ScalarKind::When => "a string",
            ScalarKind::StringList => "a string or an array of strings",
            ScalarKind::Script => "a string or a nested array of strings up to 10 levels deep",
            ScalarKind::VariableValue => "a string, a number or a boolean",
            ScalarKind::CacheFlag => "a boolean or a duration",
        }
    }
}

/// Shape of a value.
pub enum Shape {
    Scalar(ScalarKind),
    Mapping,
    /// A scalar of the given kind, or a mapping of declared children.
    ScalarOrMapping(ScalarKind),
    Sequence(&'static Entry),
    /// Arrays of items that may nest; nested arrays are flattened.
    NestedSequence {
        item: &'static Entry,
        max_depth: usize,
    },
    /// A mapping whose every value has the same entry.
    MapOf(&'static Entry),
    /// A single item, or an array of items.
    OneOrMany(&'static Entry),
    /// Any value, kept as written.
    Any,
}

pub struct Entry {
    pub description: &'static str,
    pub shape: Shape,
    pub children: &'static [(&'static str, &'static Entry)],
    /// Reject keys that are not declared.
    pub strict: bool,
    /// Entry used for undeclared keys of a non-strict mapping.
    pub dynamic: Option<&'static Entry>,
    pub required: &'static [&'static str],
    /// Key the scalar form of a `ScalarOrMapping` value is stored under.
    pub scalar_key: Option<&'static str>,
    /// Value composed when the key is absent.
    pub default: Option<&'static str>,
    pub check: Option<Check>,
}

impl Entry {
    const BASE: Entry = Entry {
        description: "",
        shape: Shape::Mapping,
        children: &[],
        strict: true,
        dynamic: None,
        required: &[],
        scalar_key: None,
        default: None,
        check: None,
    };

    /// Look up the declared entry for a child key.
    pub fn child(&self, key: &str) -> Option<&'static Entry> {
        self.children
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, entry)| *entry)
    }

    pub fn allowed_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.children.iter().map(|(name, _)| *name)
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

const fn scalar(description: &'static str, kind: ScalarKind) -> Entry {
    Entry {
        description,
        shape: Shape::Scalar(kind),
        ..Entry::BASE
    }
}

/// Maximum nesting of `rules` and `script` arrays.
pub const MAX_NESTING: usize = 10;

pub static STRING: Entry = scalar("string", ScalarKind::String);
pub static BOOLEAN: Entry = scalar("boolean", ScalarKind::Boolean);
pub static DURATION: Entry = scalar("duration", ScalarKind::Duration);
pub static STRING_LIST: Entry = scalar("string list", ScalarKind::StringList);
pub static SCRIPT: Entry = scalar("script", ScalarKind::Script);
pub static INTEGER_LIST: Entry = scalar("integer list", ScalarKind::IntegerList);
pub static WHEN: Entry = scalar("when", ScalarKind::When);

pub static JOB_WHEN: Entry = Entry {
    default: Some("on_success"),
    ..scalar("when", ScalarKind::When)
};

pub static STAGE: Entry = Entry {
    default: Some("test"),
    ..scalar("stage", ScalarKind::String)
};

pub static TAGS: Entry = Entry {
    check: Some(checks::tags),
    ..scalar("tags", ScalarKind::StringList)
};

pub static STAGES: Entry = Entry {
    description: "stages",
    shape: Shape::Sequence(&STRING),
    check: Some(checks::stages),
    ..Entry::BASE
};

pub static VARIABLE: Entry = Entry {
    description: "variable",
    shape: Shape::ScalarOrMapping(ScalarKind::VariableValue),
    children: &[
        ("value", &VARIABLE_SCALAR),
        ("description", &STRING),
        ("expand", &BOOLEAN),
        ("options", &STRING_LIST),
    ],
    scalar_key: Some("value"),
    ..Entry::BASE
};

static VARIABLE_SCALAR: Entry = scalar("variable value", ScalarKind::VariableValue);

pub static VARIABLES: Entry = Entry {
    description: "variables",
    shape: Shape::MapOf(&VARIABLE),
    check: Some(checks::variables),
    ..Entry::BASE
};

pub static IMAGE: Entry = Entry {
    description: "image",
    shape: Shape::ScalarOrMapping(ScalarKind::String),
    children: &[("name", &STRING), ("entrypoint", &STRING_LIST)],
    required: &["name"],
    scalar_key: Some("name"),
    ..Entry::BASE
};

pub static ALLOW_FAILURE: Entry = Entry {
    description: "allow failure",
    shape: Shape::ScalarOrMapping(ScalarKind::Boolean),
    children: &[("exit_codes", &INTEGER_LIST)],
    required: &["exit_codes"],
    ..Entry::BASE
};

pub static ARTIFACTS: Entry = Entry {
    description: "artifacts",
    shape: Shape::Mapping,
    children: &[
        ("name", &STRING),
        ("paths", &STRING_LIST),
        ("expire_in", &STRING),
        ("when", &STRING),
    ],
    required: &["paths"],
    check: Some(checks::artifacts),
    ..Entry::BASE
};

pub static CHANGES: Entry = Entry {
    description: "changes",
    shape: Shape::ScalarOrMapping(ScalarKind::StringList),
    children: &[("paths", &STRING_LIST), ("compare_to", &STRING)],
    required: &["paths"],
    scalar_key: Some("paths"),
    check: Some(checks::glob_list),
    ..Entry::BASE
};

pub static EXISTS: Entry = Entry {
    description: "exists",
    shape: Shape::ScalarOrMapping(ScalarKind::StringList),
    children: &[("paths", &STRING_LIST)],
    required: &["paths"],
    scalar_key: Some("paths"),
    check: Some(checks::glob_list),
    ..Entry::BASE
};

pub static RULE: Entry = Entry {
    description: "rule",
    shape: Shape::Mapping,
    children: &[
        ("if", &STRING),
        ("changes", &CHANGES),
        ("exists", &EXISTS),
        ("when", &WHEN),
        ("allow_failure", &BOOLEAN),
        ("start_in", &DURATION),
        ("variables", &VARIABLES),
    ],
    check: Some(checks::rule),
    ..Entry::BASE
};

pub static RULES: Entry = Entry {
    description: "rules",
    shape: Shape::NestedSequence {
        item: &RULE,
        max_depth: MAX_NESTING,
    },
    check: Some(checks::rules),
    ..Entry::BASE
};

pub static JOB: Entry = Entry {
    description: "job",
    shape: Shape::Mapping,
    children: &[
        ("script", &SCRIPT),
        ("before_script", &SCRIPT),
        ("after_script", &SCRIPT),
        ("image", &IMAGE),
        ("stage", &STAGE),
        ("variables", &VARIABLES),
        ("rules", &RULES),
        ("when", &JOB_WHEN),
        ("allow_failure", &ALLOW_FAILURE),
        ("artifacts", &ARTIFACTS),
        ("timeout", &DURATION),
        ("start_in", &DURATION),
        ("tags", &TAGS),
        ("extends", &STRING_LIST),
    ],
    required: &["script"],
    check: Some(checks::job),
    ..Entry::BASE
};

/// Hidden keys (`.name`) are templates or anchor holders: any value, never run.
pub static HIDDEN: Entry = Entry {
    description: "hidden job",
    shape: Shape::Any,
    ..Entry::BASE
};

pub static DEFAULT: Entry = Entry {
    description: "default",
    shape: Shape::Mapping,
    children: &[
        ("image", &IMAGE),
        ("before_script", &SCRIPT),
        ("after_script", &SCRIPT),
        ("timeout", &DURATION),
        ("artifacts", &ARTIFACTS),
        ("tags", &TAGS),
        ("allow_failure", &ALLOW_FAILURE),
    ],
    check: Some(checks::timeout),
    ..Entry::BASE
};

pub static WORKFLOW: Entry = Entry {
    description: "workflow",
    shape: Shape::Mapping,
    children: &[("name", &STRING), ("rules", &RULES)],
    ..Entry::BASE
};

static CACHE_FLAG: Entry = scalar("cache", ScalarKind::CacheFlag);

/// Include rules only support `if` and `exists`.
pub static INCLUDE_RULE: Entry = Entry {
    description: "include rule",
    shape: Shape::Mapping,
    children: &[("if", &STRING), ("exists", &EXISTS), ("when", &WHEN)],
    ..Entry::BASE
};

pub static INCLUDE_RULES: Entry = Entry {
    description: "include rules",
    shape: Shape::NestedSequence {
        item: &INCLUDE_RULE,
        max_depth: MAX_NESTING,
    },
    ..Entry::BASE
};

pub static INCLUDE_ENTRY: Entry = Entry {
    description: "include",
    shape: Shape::ScalarOrMapping(ScalarKind::String),
    children: &[
        ("local", &STRING),
        ("remote", &STRING),
        ("template", &STRING),
        ("project", &STRING),
        ("file", &STRING_LIST),
        ("ref", &STRING),
        ("artifact", &STRING),
        ("job", &STRING),
        ("cache", &CACHE_FLAG),
        ("rules", &INCLUDE_RULES),
    ],
    check: Some(checks::include_entry),
    ..Entry::BASE
};

pub static INCLUDE: Entry = Entry {
    description: "include",
    shape: Shape::OneOrMany(&INCLUDE_ENTRY),
    ..Entry::BASE
};

pub static ROOT: Entry = Entry {
    description: "root",
    shape: Shape::Mapping,
    children: &[
        ("stages", &STAGES),
        ("variables", &VARIABLES),
        ("default", &DEFAULT),
        ("include", &INCLUDE),
        ("workflow", &WORKFLOW),
        ("image", &IMAGE),
        ("before_script", &SCRIPT),
        ("after_script", &SCRIPT),
    ],
    strict: false,
    dynamic: Some(&JOB),
    check: Some(checks::root),
    ..Entry::BASE
};

/// Top-level keys that are not jobs.
pub fn is_reserved_key(key: &str) -> bool {
    ROOT.child(key).is_some()
}

//! TotalSegmentator task catalog.

/// Tasks whose names end with this marker expect MR input.
pub const MR_SUFFIX: &str = "_mr";

const PLACEHOLDER_MARKER: &str = "---";

/// A named group of task identifiers, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskGroup {
    pub name: &'static str,
    pub tasks: &'static [&'static str],
}

impl TaskGroup {
    /// The header entry shown above the group's tasks in a task list.
    pub fn placeholder(&self) -> String {
        format!("{PLACEHOLDER_MARKER} {} {PLACEHOLDER_MARKER}", self.name)
    }
}

pub static TASK_GROUPS: &[TaskGroup] = &[
    TaskGroup {
        name: "CT (default)",
        tasks: &[
            "total",
            "lung_vessels",
            "body",
            "cerebral_bleed",
            "hip_implant",
            "pleural_pericard_effusion",
            "head_glands_cavities",
            "head_muscles",
            "headneck_bones_vessels",
            "headneck_muscles",
            "liver_vessels",
            "oculomotor_muscles",
            "lung_nodules",
            "kidney_cysts",
            "breasts",
            "liver_segments",
            "craniofacial_structures",
            "abdominal_muscles",
            "teeth",
            "trunk_cavities",
            "vertebrae_body",
            "brain_structures",
            "coronary_arteries",
            "face",
        ],
    },
    TaskGroup {
        name: "MR (_mr)",
        tasks: &[
            "total_mr",
            "body_mr",
            "vertebrae_mr",
            "liver_segments_mr",
            "appendicular_bones_mr",
            "tissue_types_mr",
            "face_mr",
            "thigh_shoulder_muscles_mr",
        ],
    },
    TaskGroup {
        name: "Special / Licensed",
        tasks: &[
            "heartchambers_highres",
            "appendicular_bones",
            "tissue_types",
            "tissue_4_types",
            "brain_aneurysm",
        ],
    },
];

/// Read-only view over the task groups.
#[derive(Debug, Clone, Copy)]
pub struct TaskCatalog {
    groups: &'static [TaskGroup],
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self {
            groups: TASK_GROUPS,
        }
    }
}

impl TaskCatalog {
    pub fn groups(&self) -> &'static [TaskGroup] {
        self.groups
    }

    pub fn contains(&self, task: &str) -> bool {
        self.groups.iter().any(|g| g.tasks.contains(&task))
    }

    /// Whether `entry` is a group header rather than a task.
    pub fn is_placeholder(&self, entry: &str) -> bool {
        let entry = entry.trim();
        entry.starts_with(PLACEHOLDER_MARKER) || self.groups.iter().any(|g| g.name == entry)
    }

    /// Every entry of a grouped task list: each group's placeholder
    /// followed by its tasks.
    pub fn entries(&self) -> impl Iterator<Item = String> + '_ {
        self.groups.iter().flat_map(|group| {
            std::iter::once(group.placeholder()).chain(group.tasks.iter().map(|t| t.to_string()))
        })
    }
}

pub fn is_mr_task(task: &str) -> bool {
    task.ends_with(MR_SUFFIX)
}

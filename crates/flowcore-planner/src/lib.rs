//! Execution Planner: turns a task list's dependency graph into an
//! ordered list of parallel-safe stages via Kahn's topological sort.
//! Dependency edges are expressed in `projectSequence` values (the
//! canonical dependency identifier), never the global `id`;
//! `Stage::tasks` carries the global `id` back out since that's what
//! every downstream crate (`flowcore-executor`, `flowcore-runtime`)
//! addresses a task by.

use std::collections::{BTreeMap, HashMap, HashSet};

use flowcore_types::{ConfigErrorDetail, ExecutionError, ExecutionPlan, Stage, Task};

/// Used for a stage's duration estimate when neither a hint nor any other
/// signal is available: a provider-default.
pub const DEFAULT_TASK_DURATION_MS: i64 = 60_000;

/// Per-task duration overrides and the fallback used for everything else.
#[derive(Debug, Clone)]
pub struct PlannerOptions {
    pub duration_hints_ms: HashMap<i64, i64>,
    pub default_duration_ms: i64,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        PlannerOptions {
            duration_hints_ms: HashMap::new(),
            default_duration_ms: DEFAULT_TASK_DURATION_MS,
        }
    }
}

impl PlannerOptions {
    fn duration_for(&self, task_id: i64) -> i64 {
        self.duration_hints_ms
            .get(&task_id)
            .copied()
            .unwrap_or(self.default_duration_ms)
    }
}

/// Plans `tasks` with default options.
pub fn plan(tasks: &[Task]) -> Result<ExecutionPlan, ExecutionError> {
    plan_with_options(tasks, &PlannerOptions::default())
}

/// Plans `tasks`, estimating each stage's duration from `options`.
///
/// Tasks whose `isSubdivided` is set are not filtered out here — they still
/// occupy a node in the dependency graph so their dependents wait for them
/// correctly — the Executor is what turns them into an
/// immediate `skipped` result, not the Planner.
pub fn plan_with_options(
    tasks: &[Task],
    options: &PlannerOptions,
) -> Result<ExecutionPlan, ExecutionError> {
    if tasks.is_empty() {
        return Ok(ExecutionPlan {
            stages: Vec::new(),
            estimated_duration_ms: 0,
        });
    }

    let by_sequence: BTreeMap<i64, &Task> =
        tasks.iter().map(|t| (t.project_sequence, t)).collect();

    let mut indegree: HashMap<i64, usize> = HashMap::new();
    let mut dependents: HashMap<i64, Vec<i64>> = HashMap::new();
    for task in tasks {
        indegree.entry(task.project_sequence).or_insert(0);
        for dep in task.all_dependency_ids() {
            // A dependency id outside this task set cannot be scheduled
            // against. Dependencies are only ever drawn from the same
            // project's tasks, so treat a dangling reference as already
            // satisfied rather than rejecting the whole plan over it.
            if by_sequence.contains_key(&dep) {
                *indegree.entry(task.project_sequence).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(task.project_sequence);
            }
        }
    }

    let mut remaining: HashSet<i64> = by_sequence.keys().copied().collect();
    let mut stages = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<i64> = remaining
            .iter()
            .copied()
            .filter(|seq| indegree.get(seq).copied().unwrap_or(0) == 0)
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<i64> = remaining.into_iter().collect();
            stuck.sort_unstable();
            let task_ids = stuck
                .iter()
                .filter_map(|seq| by_sequence.get(seq).map(|t| t.id))
                .collect();
            return Err(ExecutionError::Config(ConfigErrorDetail::Cycle {
                tasks: task_ids,
            }));
        }
        ready.sort_unstable();

        let can_run_in_parallel = !ready
            .iter()
            .any(|seq| by_sequence.get(seq).is_some_and(|t| t.is_serial()));

        let task_ids: Vec<i64> = ready
            .iter()
            .filter_map(|seq| by_sequence.get(seq).map(|t| t.id))
            .collect();
        stages.push(Stage {
            tasks: task_ids,
            can_run_in_parallel,
        });

        for seq in &ready {
            remaining.remove(seq);
            if let Some(deps) = dependents.get(seq) {
                for dependent in deps {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count = count.saturating_sub(1);
                    }
                }
            }
        }
    }

    let estimated_duration_ms = stages
        .iter()
        .map(|stage| {
            stage
                .tasks
                .iter()
                .map(|id| options.duration_for(*id))
                .max()
                .unwrap_or(options.default_duration_ms)
        })
        .sum();

    Ok(ExecutionPlan {
        stages,
        estimated_duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_types::{
        ExecutionType, OutputFormat, Priority, TaskKind, TaskStatus, TriggerConfig,
    };
    use std::collections::BTreeSet;

    fn task(id: i64, seq: i64, deps: &[i64]) -> Task {
        Task {
            id,
            project_id: 1,
            project_sequence: seq,
            title: format!("task-{seq}"),
            description: None,
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: deps.iter().copied().collect::<BTreeSet<_>>(),
            trigger_config: TriggerConfig::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: None,
            generated_prompt: None,
            expected_output_format: Some(OutputFormat::Text),
            code_language: None,
            required_mcps: Vec::new(),
            mcp_config: Default::default(),
            image_config: None,
            script_language: None,
            is_subdivided: false,
            is_paused: false,
            auto_review: false,
            review_ai_provider: None,
            review_ai_model: None,
        }
    }

    /// S1 — linear chain: `#1`, `#2` depends on `#1`.
    #[test]
    fn linear_chain_produces_one_task_per_stage() {
        let tasks = vec![task(1, 1, &[]), task(2, 2, &[1])];
        let result = plan(&tasks).unwrap();
        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.stages[0].tasks, vec![1]);
        assert_eq!(result.stages[1].tasks, vec![2]);
    }

    /// S2 — diamond: `#1->{#2,#3}->#4`.
    #[test]
    fn diamond_dependency_runs_middle_stage_in_parallel() {
        let tasks = vec![
            task(1, 1, &[]),
            task(2, 2, &[1]),
            task(3, 3, &[1]),
            task(4, 4, &[2, 3]),
        ];
        let result = plan(&tasks).unwrap();
        assert_eq!(result.stages.len(), 3);
        assert_eq!(result.stages[0].tasks, vec![1]);
        assert_eq!(result.stages[1].tasks, vec![2, 3]);
        assert!(result.stages[1].can_run_in_parallel);
        assert_eq!(result.stages[2].tasks, vec![4]);
    }

    /// S3 — cycle: `#1->#2->#3->#1`.
    #[test]
    fn cycle_is_rejected_with_every_participant_named() {
        let tasks = vec![task(1, 1, &[3]), task(2, 2, &[1]), task(3, 3, &[2])];
        let err = plan(&tasks).unwrap_err();
        match err {
            ExecutionError::Config(ConfigErrorDetail::Cycle { mut tasks }) => {
                tasks.sort_unstable();
                assert_eq!(tasks, vec![1, 2, 3]);
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[test]
    fn serial_execution_type_forces_the_stage_non_parallel() {
        let mut serial_task = task(2, 2, &[1]);
        serial_task.trigger_config.execution_type = Some(ExecutionType::Serial);
        let tasks = vec![task(1, 1, &[]), serial_task, task(3, 3, &[1])];
        let result = plan(&tasks).unwrap();
        assert_eq!(result.stages[1].tasks, vec![2, 3]);
        assert!(!result.stages[1].can_run_in_parallel);
    }

    #[test]
    fn input_task_kind_forces_the_stage_non_parallel() {
        let mut input_task = task(2, 2, &[]);
        input_task.task_type = TaskKind::Input;
        let tasks = vec![task(1, 1, &[]), input_task];
        let result = plan(&tasks).unwrap();
        assert!(!result.stages[0].can_run_in_parallel);
    }

    #[test]
    fn duration_hints_pick_the_stage_maximum() {
        let tasks = vec![task(1, 1, &[]), task(2, 2, &[])];
        let mut options = PlannerOptions::default();
        options.duration_hints_ms.insert(1, 1_000);
        options.duration_hints_ms.insert(2, 5_000);
        let result = plan_with_options(&tasks, &options).unwrap();
        assert_eq!(result.estimated_duration_ms, 5_000);
    }

    #[test]
    fn a_dangling_dependency_is_treated_as_already_satisfied() {
        let tasks = vec![task(1, 1, &[99])];
        let result = plan(&tasks).unwrap();
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].tasks, vec![1]);
    }

    #[test]
    fn empty_task_list_produces_an_empty_plan() {
        let result = plan(&[]).unwrap();
        assert!(result.stages.is_empty());
        assert_eq!(result.estimated_duration_ms, 0);
    }

    #[test]
    fn a_subdivided_task_still_gates_its_dependents() {
        let mut parent = task(1, 1, &[]);
        parent.is_subdivided = true;
        let tasks = vec![parent, task(2, 2, &[1])];
        let result = plan(&tasks).unwrap();
        assert_eq!(result.stages.len(), 2);
        assert_eq!(result.stages[0].tasks, vec![1]);
        assert_eq!(result.stages[1].tasks, vec![2]);
    }
}

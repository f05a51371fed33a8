/// Instructions prepended to every task a worker receives
const WORKER_PREAMBLE: &str = r#"You are Worker {{worker_id}} in a hive-swarm session.

PROTOCOL:
1. Complete the task autonomously
2. Before editing files, claim them: hive-swarm lock file1 file2
3. When done editing, release them: hive-swarm unlock
4. When finished, run: hive-swarm done --result "your result summary"
   (on failure: hive-swarm done --status error --error "what went wrong")

TASK:
{{task}}"#;

/// Render the message delivered to a worker pane for `task`
pub fn worker_preamble(worker_id: u32, task: &str) -> String {
    WORKER_PREAMBLE
        .replace("{{worker_id}}", &worker_id.to_string())
        .replace("{{task}}", task)
}

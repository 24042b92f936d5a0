//! Task assembly from command-line style inputs

use std::path::PathBuf;

use distfork_protocol::{parse_assignment, PortSpec, TaskSpec, TaskSpecError};
use distfork_worker::WorkerConfig;

/// Raw task options, as typed by a user
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub label: Option<String>,
    pub display_name: Option<String>,
    /// Milliseconds; negative means unknown
    pub estimated_duration_ms: Option<i64>,
    pub bootstrap_archive: Option<PathBuf>,
    pub return_archive: Option<PathBuf>,
    /// `NAME=VALUE`
    pub env: Vec<String>,
    /// `REMOTE=LOCAL`, remote relative to the workspace
    pub input_files: Vec<String>,
    /// `LOCAL=REMOTE`, remote relative to the workspace
    pub output_files: Vec<String>,
    /// `LISTEN:HOST:PORT`, listener on the controller
    pub local_to_remote: Vec<String>,
    /// `LISTEN:HOST:PORT`, listener on the worker
    pub remote_to_local: Vec<String>,
    pub command: Vec<String>,
}

impl RunRequest {
    /// Parse every option and build a validated [`TaskSpec`].
    pub fn assemble(&self) -> Result<TaskSpec, TaskSpecError> {
        let mut builder = TaskSpec::builder(self.command.iter().cloned());

        if let Some(label) = &self.label {
            builder = builder.label(label);
        }
        if let Some(name) = &self.display_name {
            builder = builder.display_name(name);
        }
        if let Some(millis) = self.estimated_duration_ms {
            builder = builder.estimated_duration_ms(millis);
        }
        if let Some(path) = &self.bootstrap_archive {
            builder = builder.bootstrap_archive(path);
        }
        if let Some(path) = &self.return_archive {
            builder = builder.return_archive(path);
        }

        for assignment in &self.env {
            let (name, value) = parse_assignment(assignment)?;
            builder = builder.env(name, value);
        }
        for mapping in &self.input_files {
            let (remote, local) = parse_assignment(mapping)?;
            builder = builder.input_file(remote, local);
        }
        for mapping in &self.output_files {
            let (local, remote) = parse_assignment(mapping)?;
            builder = builder.output_file(local, remote);
        }
        for spec in &self.local_to_remote {
            builder = builder.local_to_remote(spec.parse::<PortSpec>()?);
        }
        for spec in &self.remote_to_local {
            builder = builder.remote_to_local(spec.parse::<PortSpec>()?);
        }

        builder.build()
    }
}

/// Label requested by a task that no configured worker satisfies
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No such label: {0}")]
pub struct NoSuchLabel(pub String);

/// Check that `worker` can take a task restricted to `label`.
pub fn check_label(worker: &WorkerConfig, label: Option<&str>) -> Result<(), NoSuchLabel> {
    match label {
        Some(l) if !worker.satisfies(Some(l)) => Err(NoSuchLabel(l.to_string())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request(command: &[&str]) -> RunRequest {
        RunRequest {
            command: command.iter().map(|s| s.to_string()).collect(),
            ..RunRequest::default()
        }
    }

    #[test]
    fn test_assemble_full_request() {
        let req = RunRequest {
            label: Some("linux".into()),
            estimated_duration_ms: Some(1500),
            bootstrap_archive: Some("tools.zip".into()),
            return_archive: Some("out.tgz".into()),
            env: vec!["MODE=fast".into(), "EXPR=a=b".into()],
            input_files: vec!["conf/app.yml=/etc/app.yml".into()],
            output_files: vec!["/tmp/report.txt=report.txt".into()],
            local_to_remote: vec!["9000:db:5432".into()],
            remote_to_local: vec!["8080:localhost:80".into()],
            ..request(&["make", "-j4", "all", "check"])
        };

        let spec = req.assemble().unwrap();

        assert_eq!(spec.label.as_deref(), Some("linux"));
        assert_eq!(spec.estimated_duration_ms, Some(1500));
        assert_eq!(spec.env["MODE"], "fast");
        assert_eq!(spec.env["EXPR"], "a=b");
        assert_eq!(spec.input_files[Path::new("conf/app.yml")], PathBuf::from("/etc/app.yml"));
        assert_eq!(spec.output_files[Path::new("/tmp/report.txt")], PathBuf::from("report.txt"));
        assert_eq!(spec.local_to_remote, vec![PortSpec::new(9000, "db", 5432)]);
        assert_eq!(spec.remote_to_local, vec![PortSpec::new(8080, "localhost", 80)]);
        assert_eq!(spec.display_name, "make -j4 all ...");
    }

    #[test]
    fn test_unknown_duration() {
        let req = RunRequest {
            estimated_duration_ms: Some(-1),
            ..request(&["true"])
        };
        assert_eq!(req.assemble().unwrap().estimated_duration_ms, None);
    }

    #[test]
    fn test_explicit_display_name_kept() {
        let req = RunRequest {
            display_name: Some("nightly".into()),
            ..request(&["a", "b", "c", "d"])
        };
        assert_eq!(req.assemble().unwrap().display_name, "nightly");
    }

    #[test]
    fn test_rejects_bad_inputs() {
        assert_eq!(request(&[]).assemble().unwrap_err(), TaskSpecError::EmptyCommand);

        let bad_env = RunRequest {
            env: vec!["=oops".into()],
            ..request(&["true"])
        };
        assert!(matches!(bad_env.assemble(), Err(TaskSpecError::InvalidAssignment(_))));

        let bad_port = RunRequest {
            local_to_remote: vec!["9000:db".into()],
            ..request(&["true"])
        };
        assert!(matches!(bad_port.assemble(), Err(TaskSpecError::InvalidPortSpec { .. })));

        let escaping = RunRequest {
            input_files: vec!["../etc/passwd=local".into()],
            ..request(&["true"])
        };
        assert!(matches!(escaping.assemble(), Err(TaskSpecError::EscapingPath(_))));
    }

    #[test]
    fn test_label_check() {
        let worker = WorkerConfig {
            name: "builder".into(),
            labels: vec!["linux".into()],
            ..WorkerConfig::default()
        };
        assert!(check_label(&worker, None).is_ok());
        assert!(check_label(&worker, Some("linux")).is_ok());
        assert!(check_label(&worker, Some("builder")).is_ok());
        assert_eq!(
            check_label(&worker, Some("gpu")).unwrap_err().to_string(),
            "No such label: gpu"
        );
    }
}

//! Invocation of the stolon command-line driver.

use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Stolonctl {
    pub cluster_name: String,
    pub backend: String,
    pub prefix: String,
    pub endpoints: String,
}

impl Stolonctl {
    /// A `stolonctl` command with the store flags this cluster requires.
    pub fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("stolonctl");
        command.args(args).args([
            "--cluster-name",
            &self.cluster_name,
            "--store-backend",
            &self.backend,
            "--store-prefix",
            &self.prefix,
            "--store-endpoints",
            &self.endpoints,
        ]);
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_appends_store_flags_after_args() {
        let stolonctl = Stolonctl {
            cluster_name: "main".to_string(),
            backend: "etcdv3".to_string(),
            prefix: "stolon/cluster".to_string(),
            endpoints: "http://127.0.0.1:2379".to_string(),
        };

        let command = stolonctl.command(&["failkeeper", "keeper0"]);
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_str().unwrap())
            .collect();

        assert_eq!(
            args,
            vec![
                "failkeeper",
                "keeper0",
                "--cluster-name",
                "main",
                "--store-backend",
                "etcdv3",
                "--store-prefix",
                "stolon/cluster",
                "--store-endpoints",
                "http://127.0.0.1:2379",
            ]
        );
    }
}

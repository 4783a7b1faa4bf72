// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use tokio::runtime::Runtime;

    use shoal_lib::{
        action::ActionOptions, component::ComponentKind, event::Collector, filesystem::Selection,
        test_env::*,
    };

    fn test_env_helper(test_id: &str) -> TestEnvironment {
        TestEnvironment::new(test_id, env!("CARGO_BIN_EXE_shoal"))
    }

    /// Stopping a target writes when it begins and ends to the timeline, and takes a second.
    fn record_stops(env: &mut TestEnvironment) {
        let timeline = env.path("timeline");
        env.set_command(
            "target_stop",
            &format!(
                "echo '{{label}} begin {{umount_flags}}' >> {timeline}; sleep 1; \
                 echo '{{label}} end' >> {timeline}"
            ),
        );
    }

    /// Two file-backed OSTs on `ost_servers`, with the MGT on this host.
    fn write_config(env: &TestEnvironment, ost_servers: [&str; 2]) {
        let mgt = env.device("mgt.img");
        let ost0 = env.device("ost0.img");
        let ost1 = env.device("ost1.img");
        let [server0, server1] = ost_servers;
        env.write_config(&format!(
            r#"
[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "localhost"

[[filesystems.servers]]
hostname = "oss1"

[[filesystems.servers]]
hostname = "oss2"

[[filesystems.targets]]
type = "mgt"
device = "{mgt}"
block = false
server = "localhost"

[[filesystems.targets]]
type = "ost"
index = 0
device = "{ost0}"
block = false
server = "{server0}"

[[filesystems.targets]]
type = "ost"
index = 1
device = "{ost1}"
block = false
server = "{server1}"
"#
        ));
    }

    /// Start and then stop both OSTs, returning the timeline of the stops.
    fn start_and_stop_osts(env: &TestEnvironment) -> Vec<String> {
        let fs = env.filesystem();
        let osts = Selection {
            kinds: vec![ComponentKind::Ost],
            ..Default::default()
        };
        let options = ActionOptions::default();
        let sink = Collector::new();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let report = fs.start(&osts, &options, &sink).await.unwrap();
            assert!(!report.rc.has_failure(), "start: {}", report.rc);
            let report = fs.stop(&osts, &options, &sink).await.unwrap();
            assert!(!report.rc.has_failure(), "stop: {}", report.rc);
        });

        env.lines("timeline")
    }

    /// Each stop ends before the next one begins, and releases its loop device.
    fn assert_one_at_a_time(timeline: &[String]) {
        assert_eq!(timeline.len(), 4, "{timeline:?}");
        for pair in timeline.chunks(2) {
            let label = pair[0].split_whitespace().next().unwrap();
            assert_eq!(pair[0], format!("{label} begin -d"), "{timeline:?}");
            assert_eq!(pair[1], format!("{label} end"), "{timeline:?}");
        }
        assert_ne!(timeline[0], timeline[2]);
    }

    #[test]
    fn remote_loop_stops_go_one_server_at_a_time() {
        let mut env = test_env_helper("loop_remote");
        env.own_mount_table("oss1");
        env.own_mount_table("oss2");
        record_stops(&mut env);
        write_config(&env, ["oss1", "oss2"]);

        assert_one_at_a_time(&start_and_stop_osts(&env));

        let stops: Vec<String> = env
            .remote_log()
            .into_iter()
            .filter(|l| l.contains(" stop "))
            .collect();
        assert_eq!(stops.len(), 2);
    }

    #[test]
    fn local_loop_stops_are_serialized() {
        let mut env = test_env_helper("loop_local");
        record_stops(&mut env);
        write_config(&env, ["localhost", "localhost"]);

        assert_one_at_a_time(&start_and_stop_osts(&env));
        assert!(env.remote_log().is_empty());
    }
}

// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use tokio::runtime::Runtime;

    use shoal_lib::{
        action::ActionOptions,
        component::ComponentState,
        event::{Collector, DoneStatus, Event},
        filesystem::{FsError, Selection},
        rc::RcFlags,
        server::FailoverError,
        test_env::*,
    };

    fn test_env_helper(test_id: &str) -> TestEnvironment {
        TestEnvironment::new(test_id, env!("CARGO_BIN_EXE_shoal"))
    }

    /// An MGT on this host and an MDT whose home server is srv1, which can fail over to srv2.
    /// Both srv1 and srv2 are reached through the fake remote shell.
    fn write_config(env: &TestEnvironment) {
        let mgt = env.device("mgt.img");
        let mdt = env.device("mdt0.img");
        env.write_config(&format!(
            r#"
[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "localhost"

[[filesystems.servers]]
hostname = "srv1"

[[filesystems.servers]]
hostname = "srv2"

[[filesystems.targets]]
type = "mgt"
device = "{mgt}"
block = false
server = "localhost"

[[filesystems.targets]]
type = "mdt"
index = 0
device = "{mdt}"
block = false
server = "srv1"
failservers = ["srv2"]
"#
        ));
    }

    #[test]
    fn format_then_start_on_failover_server() {
        let env = test_env_helper("failover_start");
        write_config(&env);
        let fs = env.filesystem();
        let all = Selection::default();
        let options = ActionOptions::default();
        let sink = Collector::new();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let report = fs.format(&all, &options, &sink).await.unwrap();
            assert_eq!(report.rc, RcFlags::OFFLINE);
            assert!(report.proxy_errors.is_empty());
            assert_eq!(env.remote_log().len(), 1);
            assert!(env.remote_log()[0].starts_with("srv1 "));
            assert!(env.command_log().contains(&"testfs-MDT0000 format localhost".to_string()));

            let moved = fs.failover(&["srv2"], &all).unwrap();
            assert_eq!(moved, vec!["testfs-MDT0000".to_string()]);

            let report = fs.start(&all, &options, &sink).await.unwrap();
            assert!(report.rc.contains(RcFlags::MIGRATED));
            assert!(!report.rc.intersects(RcFlags::ERROR));
            assert_eq!(
                fs.component("MGS").unwrap().state(),
                Some(ComponentState::Mounted)
            );
            assert_eq!(
                fs.component("testfs-MDT0000").unwrap().state(),
                Some(ComponentState::Migrated)
            );

            let remote = env.remote_log();
            assert_eq!(remote.len(), 2);
            assert!(remote[1].starts_with("srv2 "));
            assert!(remote[1].contains("-F srv2"));
        });

        // The events from the remote side were passed on.
        assert!(sink.events().iter().any(|e| matches!(
            e,
            Event::CompDone {
                label,
                state: Some(ComponentState::Migrated),
                status: DoneStatus::Done,
                ..
            } if label == "testfs-MDT0000"
        )));
    }

    #[test]
    fn status_finds_component_on_failover_server() {
        let mut env = test_env_helper("failover_status");
        env.own_mount_table("srv1");
        env.own_mount_table("srv2");
        write_config(&env);
        let all = Selection::default();
        let options = ActionOptions::default();
        let sink = Collector::new();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let fs = env.filesystem();
            fs.format(&all, &options, &sink).await.unwrap();
            fs.failover(&["srv2"], &all).unwrap();
            let report = fs.start(&all, &options, &sink).await.unwrap();
            assert!(report.rc.contains(RcFlags::MIGRATED));
            assert_eq!(env.lines("mounts_srv2").len(), 1);
            assert!(env.lines("mounts_srv1").is_empty());

            // A later invocation has not been told about the failover.
            let fs = env.filesystem();
            let report = fs.status(&all, &sink).await.unwrap();
            let mdt = report.component("testfs-MDT0000").unwrap();
            assert_eq!(mdt.state, Some(ComponentState::Migrated));
            assert_eq!(mdt.server, "srv2");
            assert_eq!(report.rc, RcFlags::MIGRATED);

            let remote = env.remote_log();
            let searched = remote.last().unwrap();
            assert!(searched.starts_with("srv2 ") && searched.contains("-F srv2"));
            assert!(remote
                .iter()
                .any(|l| l.starts_with("srv1 ") && l.contains(" status ")));

            let report = fs.stop(&all, &options, &sink).await.unwrap();
            assert!(!report.rc.has_failure());
            assert!(env.lines("mounts_srv2").is_empty());

            // Stopped everywhere: nothing to find, and the home server is kept.
            let fs = env.filesystem();
            let report = fs.status(&all, &sink).await.unwrap();
            let mdt = report.component("testfs-MDT0000").unwrap();
            assert_eq!(mdt.state, Some(ComponentState::Offline));
            assert_eq!(mdt.server, "srv1");
            assert_eq!(report.rc, RcFlags::OFFLINE);
        });
    }

    #[test]
    fn failover_candidates() {
        let env = test_env_helper("failover_candidates");
        let dev = env.device("ost.img");
        env.write_config(&format!(
            r#"
[[filesystems]]
name = "testfs"

[[filesystems.servers]]
hostname = "localhost"

[[filesystems.servers]]
hostname = "foo1"

[[filesystems.servers]]
hostname = "foo2"

[[filesystems.servers]]
hostname = "foo3"

[[filesystems.targets]]
type = "mgt"
device = "{dev}"
server = "localhost"

[[filesystems.targets]]
type = "ost"
index = 0
device = "{dev}"
server = "foo1"
failservers = ["foo2", "foo3"]
"#
        ));
        let fs = env.filesystem();
        let all = Selection::default();
        let ost = fs.component("testfs-OST0000").unwrap();

        assert!(fs.failover(&["bar"], &all).unwrap().is_empty());
        assert_eq!(ost.server().hostname(), "foo1");

        assert!(matches!(
            fs.failover(&["foo2", "foo3"], &all),
            Err(FsError::Failover(_, FailoverError::Ambiguous(_)))
        ));
        assert_eq!(ost.server().hostname(), "foo1");

        assert_eq!(fs.failover(&["foo3"], &all).unwrap().len(), 1);
        assert_eq!(ost.server().hostname(), "foo3");
        assert!(ost.failservers().contains(ost.server().hostname()));
    }
}

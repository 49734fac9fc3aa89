// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generation of the per-resource device configuration file.
//!
//! The replication daemon reads one `<resource>.res` file per resource.
//! The file is regenerated wholesale on every convergence pass and written
//! atomically (temp file + rename), so the daemon never sees a partially
//! written configuration.

use crate::evaluate::ResourceState;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use meridian_common::api::DesiredResource;
use meridian_common::api::NodeSpec;
use meridian_common::names::NodeName;
use meridian_common::names::ResourceName;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;

pub const RES_FILE_SUFFIX: &str = ".res";

// The daemon requires a disk path for peers with backing storage, but
// their actual paths are only meaningful on the peer itself.
const PEER_DISK_PLACEHOLDER: &str = "/dev/replicated/peer/disk";

pub fn res_file_path(dir: &Utf8Path, rsc: &ResourceName) -> Utf8PathBuf {
    dir.join(format!("{rsc}{RES_FILE_SUFFIX}"))
}

fn address_line(addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(v4) => format!("address ipv4 {v4}:{port};"),
        IpAddr::V6(v6) => format!("address ipv6 [{v6}]:{port};"),
    }
}

/// Render the complete configuration for one resource: the local host
/// section, one section per peer, and the connection mesh over all of
/// them.
pub fn render_res_file(
    local_node: &NodeName,
    resource: &DesiredResource,
    state: &ResourceState,
    nodes: &BTreeMap<NodeName, NodeSpec>,
) -> String {
    let node_addr = |name: &NodeName| {
        nodes
            .get(name)
            .map(|n| n.addr)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    };

    let mut out = String::new();
    let mut w = |line: &str| {
        out.push_str(line);
        out.push('\n');
    };

    w("# Generated by the satellite convergence engine. DO NOT EDIT.");
    w(&format!("resource \"{}\" {{", resource.name));
    w("    options {");
    w("        auto-promote yes;");
    w("    }");
    w("    net {");
    w("        protocol C;");
    w(&format!("        max-peers {};", resource.peer_slots));
    w("    }");

    // Volumes shown for every host: everything desired, minus volumes
    // flagged for deletion and volumes the desired model does not know.
    let volumes: Vec<_> = state
        .volumes
        .values()
        .filter(|v| !v.skip && !v.marked_for_delete)
        .collect();

    w(&format!("    on \"{local_node}\" {{"));
    w(&format!("        node-id {};", resource.node_id));
    w(&format!(
        "        {}",
        address_line(node_addr(local_node), resource.port)
    ));
    for vlm in &volumes {
        w(&format!("        volume {} {{", vlm.number));
        if let Some(minor) = vlm.minor {
            w(&format!("            device minor {minor};"));
        }
        if resource.flags.diskless {
            w("            disk none;");
        } else {
            match &vlm.backing_path {
                Some(path) => w(&format!("            disk \"{path}\";")),
                None => w("            disk none;"),
            }
        }
        w("            meta-disk internal;");
        w("        }");
    }
    w("    }");

    for peer in &resource.peers {
        w(&format!("    on \"{}\" {{", peer.node));
        w(&format!("        node-id {};", peer.node_id));
        w(&format!(
            "        {}",
            address_line(node_addr(&peer.node), resource.port)
        ));
        for vlm in &volumes {
            w(&format!("        volume {} {{", vlm.number));
            if let Some(minor) = vlm.minor {
                w(&format!("            device minor {minor};"));
            }
            if peer.diskless {
                w("            disk none;");
            } else {
                w(&format!("            disk \"{PEER_DISK_PLACEHOLDER}\";"));
            }
            w("            meta-disk internal;");
            w("        }");
        }
        w("    }");
    }

    let mut hosts = format!("\"{local_node}\"");
    for peer in &resource.peers {
        hosts.push_str(&format!(" \"{}\"", peer.node));
    }
    w("    connection-mesh {");
    w(&format!("        hosts {hosts};"));
    w("    }");
    w("}");
    out
}

/// Atomically (re)write the configuration file for `rsc`.
pub async fn write_res_file(
    dir: &Utf8Path,
    rsc: &ResourceName,
    content: &str,
) -> std::io::Result<()> {
    let target = res_file_path(dir, rsc);
    let temp = dir.join(format!(".{rsc}{RES_FILE_SUFFIX}.tmp"));
    tokio::fs::write(&temp, content).await?;
    tokio::fs::rename(&temp, &target).await
}

/// Delete the configuration file for `rsc`. Deleting a file that does not
/// exist is not an error; returns whether a file was removed.
pub async fn delete_res_file(
    dir: &Utf8Path,
    rsc: &ResourceName,
) -> std::io::Result<bool> {
    match tokio::fs::remove_file(res_file_path(dir, rsc)).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluate::evaluate;
    use crate::testing::example_node;
    use crate::testing::example_resource_with_volumes;
    use std::collections::BTreeSet;

    fn render_example() -> String {
        let resource = example_resource_with_volumes("r0", &["beta"], 1);
        let mut state = evaluate(
            &"r0".parse().unwrap(),
            Some(&resource),
            None,
            &BTreeSet::new(),
        );
        state
            .volumes
            .values_mut()
            .for_each(|v| v.backing_path = Some("/dev/pool0/r0_00000".into()));
        let nodes = [
            ("alpha".parse().unwrap(), example_node("alpha")),
            ("beta".parse().unwrap(), example_node("beta")),
        ]
        .into_iter()
        .collect();
        render_res_file(
            &"alpha".parse().unwrap(),
            &resource,
            &state,
            &nodes,
        )
    }

    #[test]
    fn renders_local_and_peer_sections() {
        let content = render_example();
        assert!(content.contains("resource \"r0\" {"));
        assert!(content.contains("on \"alpha\" {"));
        assert!(content.contains("on \"beta\" {"));
        assert!(content.contains("disk \"/dev/pool0/r0_00000\";"));
        assert!(content.contains("max-peers 7;"));
        assert!(content.contains("hosts \"alpha\" \"beta\";"));
        assert!(content.contains("meta-disk internal;"));
    }

    #[test]
    fn delete_marked_volumes_are_left_out() {
        let mut resource = example_resource_with_volumes("r0", &[], 2);
        resource.volumes[1].flags.delete = true;
        let state = evaluate(
            &"r0".parse().unwrap(),
            Some(&resource),
            None,
            &BTreeSet::new(),
        );
        let nodes = BTreeMap::new();
        let content = render_res_file(
            &"alpha".parse().unwrap(),
            &resource,
            &state,
            &nodes,
        );
        assert!(content.contains("volume 0 {"));
        assert!(!content.contains("volume 1 {"));
    }

    #[tokio::test]
    async fn write_and_delete_are_idempotent_enough() {
        let dir = camino_tempfile::tempdir().unwrap();
        let rsc: ResourceName = "r0".parse().unwrap();

        write_res_file(dir.path(), &rsc, "resource \"r0\" {}\n")
            .await
            .unwrap();
        let on_disk =
            tokio::fs::read_to_string(res_file_path(dir.path(), &rsc))
                .await
                .unwrap();
        assert_eq!(on_disk, "resource \"r0\" {}\n");

        assert!(delete_res_file(dir.path(), &rsc).await.unwrap());
        // Deleting a file that is already gone is not an error.
        assert!(!delete_res_file(dir.path(), &rsc).await.unwrap());
    }
}

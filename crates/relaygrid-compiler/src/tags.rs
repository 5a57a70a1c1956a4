//! Outbound tag codec.
//!
//! Every outbound the compiler emits carries a short tag that encodes which
//! binding produced it. The runtime reports traffic and health per tag, so
//! decoding must recover the binding without any lookup table.
//!
//! | kind            | format                                        |
//! |-----------------|-----------------------------------------------|
//! | rule outbound   | `ro_{rule}_{binding}`                         |
//! | tunnel outbound | `to_{tunnel}_{binding}`                       |
//! | rule bridge     | `rb_{rule}_{binding}_{peer}_{allocation}`     |
//! | rule portal     | `rp_{rule}_{binding}_{peer}_{allocation}`     |
//! | tunnel bridge   | `tb_{tunnel}_{binding}_{peer}_{allocation}`   |
//! | tunnel portal   | `tp_{tunnel}_{binding}_{peer}_{allocation}`   |
//!
//! The allocation is the last field and may itself contain `_`.

use std::sync::LazyLock;

use regex::Regex;

use relaygrid_state::{BindingId, BindingScope, NodeId, OutboundBinding, StateResult};

use crate::repository::TopologyRepository;

/// Prefix of interconnect outbounds on bridge nodes.
pub const INTERCONNECT_PREFIX: &str = "ic-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReverseSide {
    Bridge,
    Portal,
}

/// Decoded reference to the binding behind an outbound tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagRef {
    Outbound {
        scope: BindingScope,
        binding: BindingId,
    },
    Reverse {
        scope: BindingScope,
        side: ReverseSide,
        binding: BindingId,
        /// Node on the other end of the reverse link.
        peer: NodeId,
        allocation: String,
    },
}

type Builder = fn(&regex::Captures<'_>) -> Option<TagRef>;

/// Decoders in the order they are tried, most specific first.
static PATTERNS: LazyLock<Vec<(Regex, Builder)>> = LazyLock::new(|| {
    let reverse: Builder = |c| {
        let (scope_id, binding, peer) = (num(c, 2)?, num(c, 3)?, num(c, 4)?);
        let (scope, side) = match &c[1] {
            "rb" => (BindingScope::Rule(scope_id), ReverseSide::Bridge),
            "rp" => (BindingScope::Rule(scope_id), ReverseSide::Portal),
            "tb" => (BindingScope::Tunnel(scope_id), ReverseSide::Bridge),
            "tp" => (BindingScope::Tunnel(scope_id), ReverseSide::Portal),
            _ => return None,
        };
        Some(TagRef::Reverse {
            scope,
            side,
            binding,
            peer,
            allocation: c[5].to_string(),
        })
    };
    let outbound: Builder = |c| {
        let (scope_id, binding) = (num(c, 2)?, num(c, 3)?);
        let scope = match &c[1] {
            "ro" => BindingScope::Rule(scope_id),
            "to" => BindingScope::Tunnel(scope_id),
            _ => return None,
        };
        Some(TagRef::Outbound { scope, binding })
    };
    vec![
        (
            Regex::new(r"(?s)^(rb|rp|tb|tp)_(\d+)_(\d+)_(\d+)_(.*)$").expect("static pattern"),
            reverse,
        ),
        (
            Regex::new(r"^(ro|to)_(\d+)_(\d+)$").expect("static pattern"),
            outbound,
        ),
    ]
});

fn num(c: &regex::Captures<'_>, i: usize) -> Option<u64> {
    c.get(i)?.as_str().parse().ok()
}

impl TagRef {
    pub fn scope(&self) -> BindingScope {
        match self {
            TagRef::Outbound { scope, .. } | TagRef::Reverse { scope, .. } => *scope,
        }
    }

    pub fn binding(&self) -> BindingId {
        match self {
            TagRef::Outbound { binding, .. } | TagRef::Reverse { binding, .. } => *binding,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            TagRef::Outbound { scope, binding } => match scope {
                BindingScope::Rule(id) => format!("ro_{id}_{binding}"),
                BindingScope::Tunnel(id) => format!("to_{id}_{binding}"),
            },
            TagRef::Reverse {
                scope,
                side,
                binding,
                peer,
                allocation,
            } => {
                let (prefix, id) = match (scope, side) {
                    (BindingScope::Rule(id), ReverseSide::Bridge) => ("rb", id),
                    (BindingScope::Rule(id), ReverseSide::Portal) => ("rp", id),
                    (BindingScope::Tunnel(id), ReverseSide::Bridge) => ("tb", id),
                    (BindingScope::Tunnel(id), ReverseSide::Portal) => ("tp", id),
                };
                format!("{prefix}_{id}_{binding}_{peer}_{allocation}")
            }
        }
    }

    /// Decode a tag. Unknown or malformed tags yield `None`, never a panic.
    ///
    /// Interconnect tags (`ic-{bridge_tag}`) decode to their bridge reference.
    pub fn decode(tag: &str) -> Option<TagRef> {
        if let Some(inner) = tag.strip_prefix(INTERCONNECT_PREFIX) {
            return match Self::decode_plain(inner)? {
                r @ TagRef::Reverse {
                    side: ReverseSide::Bridge,
                    ..
                } => Some(r),
                _ => None,
            };
        }
        Self::decode_plain(tag)
    }

    fn decode_plain(tag: &str) -> Option<TagRef> {
        PATTERNS
            .iter()
            .find_map(|(re, build)| re.captures(tag).and_then(|c| build(&c)))
    }
}

/// Interconnect outbound tag for a bridge tag.
pub fn interconnect_tag(bridge_tag: &str) -> String {
    format!("{INTERCONNECT_PREFIX}{bridge_tag}")
}

/// Tag of the routing balancer `name` within a rule or tunnel.
pub fn balancer_tag(scope: BindingScope, name: &str) -> String {
    match scope {
        BindingScope::Rule(id) => format!("lb_{id}_{name}"),
        BindingScope::Tunnel(id) => format!("tlb_{id}_{name}"),
    }
}

/// Tag of the forwarding inbound on a tunnel's source node.
pub fn tunnel_inbound_tag(tunnel_id: u64) -> String {
    format!("tin_{tunnel_id}")
}

/// Telemetry role of an outbound as seen from the node that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    NodeOutbound,
    Reverse,
    ReverseInterconn,
    TunnelOutbound,
    TunnelReverse,
    TunnelReverseInterconn,
}

impl LinkRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRole::NodeOutbound => "node_outbound",
            LinkRole::Reverse => "reverse",
            LinkRole::ReverseInterconn => "reverse_interconn",
            LinkRole::TunnelOutbound => "tunnel_outbound",
            LinkRole::TunnelReverse => "tunnel_reverse",
            LinkRole::TunnelReverseInterconn => "tunnel_reverse_interconn",
        }
    }
}

/// A tag resolved against the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTag {
    pub tag: TagRef,
    pub binding: OutboundBinding,
    pub role: LinkRole,
    pub source_node_id: NodeId,
    pub dest_node_id: Option<NodeId>,
}

/// Resolve a tag reported by `node_id` to its binding and link role.
///
/// `Ok(None)` covers every unresolved case: undecodable tags, deleted
/// bindings, and tags that do not belong on the reporting node.
pub fn resolve<R: TopologyRepository + ?Sized>(
    repo: &R,
    node_id: NodeId,
    tag: &str,
) -> StateResult<Option<ResolvedTag>> {
    let Some(tag_ref) = TagRef::decode(tag) else {
        return Ok(None);
    };
    let Some(binding) = repo.binding(tag_ref.binding())? else {
        return Ok(None);
    };
    if binding.scope != tag_ref.scope() {
        return Ok(None);
    }
    let tunnel = matches!(binding.scope, BindingScope::Tunnel(_));

    let resolved = match &tag_ref {
        TagRef::Outbound { .. } => {
            if binding.is_reverse() || binding.node_id != node_id {
                return Ok(None);
            }
            let role = if tunnel {
                LinkRole::TunnelOutbound
            } else {
                LinkRole::NodeOutbound
            };
            (role, binding.node_id, binding.connector.dest_node_id)
        }
        TagRef::Reverse { side, peer, .. } => {
            let (Some(bridge), Some(portal)) = (binding.bridge_node_id(), binding.portal_node_id())
            else {
                return Ok(None);
            };
            match side {
                ReverseSide::Bridge if node_id == bridge && *peer == portal => {
                    let role = if tunnel {
                        LinkRole::TunnelReverseInterconn
                    } else {
                        LinkRole::ReverseInterconn
                    };
                    (role, bridge, Some(portal))
                }
                ReverseSide::Portal if node_id == portal && *peer == bridge => {
                    let role = if tunnel {
                        LinkRole::TunnelReverse
                    } else {
                        LinkRole::Reverse
                    };
                    (role, portal, Some(bridge))
                }
                _ => return Ok(None),
            }
        }
    };

    let (role, source_node_id, dest_node_id) = resolved;
    Ok(Some(ResolvedTag {
        tag: tag_ref,
        binding,
        role,
        source_node_id,
        dest_node_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_kinds() -> Vec<TagRef> {
        let mut refs = vec![
            TagRef::Outbound {
                scope: BindingScope::Rule(1),
                binding: 22,
            },
            TagRef::Outbound {
                scope: BindingScope::Tunnel(3),
                binding: 4,
            },
        ];
        for scope in [BindingScope::Rule(7), BindingScope::Tunnel(8)] {
            for side in [ReverseSide::Bridge, ReverseSide::Portal] {
                refs.push(TagRef::Reverse {
                    scope,
                    side,
                    binding: 90,
                    peer: 5,
                    allocation: "main_backup_2".to_string(),
                });
            }
        }
        // Allocation names are free text, the empty one included.
        refs.push(TagRef::Reverse {
            scope: BindingScope::Rule(1),
            side: ReverseSide::Portal,
            binding: 2,
            peer: 3,
            allocation: String::new(),
        });
        refs
    }

    // ── Round trip ─────────────────────────────────────────────────

    #[test]
    fn every_kind_round_trips() {
        for r in all_kinds() {
            let tag = r.encode();
            assert_eq!(TagRef::decode(&tag), Some(r), "tag {tag}");
        }
    }

    #[test]
    fn encodings_match_documented_formats() {
        let tags: Vec<String> = all_kinds().iter().map(TagRef::encode).collect();
        assert_eq!(
            tags,
            vec![
                "ro_1_22",
                "to_3_4",
                "rb_7_90_5_main_backup_2",
                "rp_7_90_5_main_backup_2",
                "tb_8_90_5_main_backup_2",
                "tp_8_90_5_main_backup_2",
                "rp_1_2_3_",
            ]
        );
    }

    #[test]
    fn interconnect_decodes_to_bridge() {
        let bridge = TagRef::Reverse {
            scope: BindingScope::Rule(1),
            side: ReverseSide::Bridge,
            binding: 2,
            peer: 3,
            allocation: "a".to_string(),
        };
        let ic = interconnect_tag(&bridge.encode());
        assert_eq!(ic, "ic-rb_1_2_3_a");
        assert_eq!(TagRef::decode(&ic), Some(bridge));
        // Only bridges have interconnects.
        assert_eq!(TagRef::decode("ic-ro_1_2"), None);
        assert_eq!(TagRef::decode("ic-rp_1_2_3_a"), None);
    }

    // ── Garbage ────────────────────────────────────────────────────

    #[test]
    fn garbage_decodes_to_none() {
        for tag in [
            "",
            "direct",
            "block",
            "ro_1",
            "ro_1_2_3",
            "ro_a_2",
            "rb_1_2_3",
            "xx_1_2",
            "lb_1_main",
            "tin_4",
            "ro_99999999999999999999999_1",
            "ic-",
            "ic-ic-rb_1_2_3_a",
        ] {
            assert_eq!(TagRef::decode(tag), None, "tag {tag:?}");
        }
    }

    #[test]
    fn auxiliary_tags() {
        assert_eq!(balancer_tag(BindingScope::Rule(3), "main"), "lb_3_main");
        assert_eq!(balancer_tag(BindingScope::Tunnel(3), "main"), "tlb_3_main");
        assert_eq!(tunnel_inbound_tag(9), "tin_9");
    }
}

//! DMTF-standard driver: `EthernetInterfaces` and `Processors`.

use tracing::{debug, warn};

use super::{normalize_mac, open_collection, populated, Member};
use crate::discovery::aggregate::{
    ComponentKind, ComponentRecord, SubtreeOutcome, SystemAggregate, ATTR_CORES,
    ATTR_DESCRIPTION, ATTR_MAC, ATTR_MANUFACTURER, ATTR_MODEL,
};
use crate::discovery::status::ResourceState;
use crate::discovery::DiscoveryContext;
use crate::redfish::model::{ComputerSystem, EthernetInterface, Processor};

pub(crate) async fn discover(
    ctx: &DiscoveryContext<'_>,
    system: &ComputerSystem,
    agg: &mut SystemAggregate,
) {
    ethernet_interfaces(ctx, system, agg).await;
    processors(ctx, system, agg).await;
}

/// Member prefixes keyed by ordinal alone, e.g. `EthernetInterfaces/eth1`.
const INTERFACE_PREFIXES: &[&str] = &["", "eth", "nic"];
/// e.g. `Processors/CPU0`.
const PROCESSOR_PREFIXES: &[&str] = &["", "cpu"];

/// Interface identifier: `{endpoint}/eth{member}`.
pub(crate) fn interface_id(endpoint: &str, member: &Member) -> String {
    format!("{}/eth{}", endpoint, member.key())
}

/// Processor identifier: `{endpoint}p{member}`.
pub(crate) fn processor_id(endpoint: &str, member: &Member) -> String {
    format!("{}p{}", endpoint, member.key())
}

async fn ethernet_interfaces(
    ctx: &DiscoveryContext<'_>,
    system: &ComputerSystem,
    agg: &mut SystemAggregate,
) {
    let link = system.ethernet_interfaces.as_ref().map(|l| l.odata_id.clone());
    let mut subtree = SubtreeOutcome::new("EthernetInterfaces", link.clone());

    let members = match link {
        Some(path) => open_collection(ctx, agg, &mut subtree, &path, INTERFACE_PREFIXES).await,
        None => None,
    };

    for member in members.unwrap_or_default() {
        let mut state = ResourceState::new(member.path());
        match ctx.fetch::<EthernetInterface>(&mut state).await {
            Ok(fetched) => {
                state.verifying();
                let nic = fetched.value;
                match populated(nic.mac_address.as_deref()) {
                    None => {
                        debug!(path = %member.path(), "Interface has no MAC address, skipping");
                        state.verified();
                    }
                    Some(mac) => match normalize_mac(mac) {
                        Ok(mac) => {
                            let mut record = ComponentRecord::new(
                                interface_id(ctx.endpoint.id.as_str(), &member),
                                ComponentKind::NodeEnetInterface,
                                &ctx.endpoint.id,
                                member.path(),
                            )
                            .with_attribute(ATTR_MAC, mac)
                            .with_raw(fetched.raw);
                            if let Some(desc) = populated(nic.description.as_deref()) {
                                record = record.with_attribute(ATTR_DESCRIPTION, desc);
                            }
                            if agg.insert(record) {
                                subtree.contributed += 1;
                                state.verified();
                            } else {
                                state.decode_failed("duplicate component id");
                            }
                        }
                        Err(reason) => {
                            warn!(path = %member.path(), %reason, "Interface failed verification");
                            state.decode_failed(reason);
                        }
                    },
                }
            }
            Err(e) => {
                warn!(path = %member.path(), error = %e, "Interface fetch failed");
            }
        }
        subtree.absorb(state.status());
        agg.track(state);
    }

    agg.finish_subtree(subtree);
}

/// `Processors` sub-tree; shared with vendor drivers.
pub(crate) async fn processors(
    ctx: &DiscoveryContext<'_>,
    system: &ComputerSystem,
    agg: &mut SystemAggregate,
) {
    let link = system.processors.as_ref().map(|l| l.odata_id.clone());
    let mut subtree = SubtreeOutcome::new("Processors", link.clone());

    let members = match link {
        Some(path) => open_collection(ctx, agg, &mut subtree, &path, PROCESSOR_PREFIXES).await,
        None => None,
    };

    for member in members.unwrap_or_default() {
        let mut state = ResourceState::new(member.path());
        match ctx.fetch::<Processor>(&mut state).await {
            Ok(fetched) => {
                state.verifying();
                let cpu = fetched.value;
                if cpu.is_absent() {
                    debug!(path = %member.path(), "Processor socket empty, skipping");
                    state.verified();
                } else if cpu.id.trim().is_empty() {
                    warn!(path = %member.path(), "Processor has no Id");
                    state.decode_failed("processor has no Id");
                } else {
                    let mut record = ComponentRecord::new(
                        processor_id(ctx.endpoint.id.as_str(), &member),
                        ComponentKind::Processor,
                        &ctx.endpoint.id,
                        member.path(),
                    )
                    .with_raw(fetched.raw);
                    if let Some(model) = populated(cpu.model.as_deref()) {
                        record = record.with_attribute(ATTR_MODEL, model);
                    }
                    if let Some(manufacturer) = populated(cpu.manufacturer.as_deref()) {
                        record = record.with_attribute(ATTR_MANUFACTURER, manufacturer);
                    }
                    if let Some(cores) = cpu.total_cores {
                        record = record.with_attribute(ATTR_CORES, cores.to_string());
                    }
                    if agg.insert(record) {
                        subtree.contributed += 1;
                        state.verified();
                    } else {
                        state.decode_failed("duplicate component id");
                    }
                }
            }
            Err(e) => {
                warn!(path = %member.path(), error = %e, "Processor fetch failed");
            }
        }
        subtree.absorb(state.status());
        agg.track(state);
    }

    agg.finish_subtree(subtree);
}

//! Foxconn driver: NICs through the Insyde NCSI OEM extension.
//!
//! ```text
//! ComputerSystem.Oem.InsydeNcsi.Ncsi ─▶ Ncsi collection
//!     └─▶ member (Id, VersionID.FirmwareName, Package[])
//!           └─▶ first Package ─▶ PackageInfo[] channels (ChannelIndex, MACAddress)
//! ```
//!
//! Every channel with a MAC becomes one interface record. A member whose
//! firmware name is on the onboard allow-list marks its interfaces as the
//! node's onboard NIC (`-node_eth` id suffix and `Role=onboard`).

use tracing::{debug, warn};

use super::{
    normalize_mac, normalized_segment, open_collection, populated, standard, trailing_number,
    Member,
};
use crate::discovery::aggregate::{
    ComponentKind, ComponentRecord, SubtreeOutcome, SystemAggregate, ATTR_CHANNEL,
    ATTR_DESCRIPTION, ATTR_FIRMWARE_NAME, ATTR_MAC, ATTR_ROLE, ROLE_ONBOARD,
};
use crate::discovery::status::ResourceState;
use crate::discovery::DiscoveryContext;
use crate::redfish::model::{ComputerSystem, NcsiMember, NcsiPackage, ResourceId};

const DESCRIPTION: &str = "Auto-detected Foxconn NCSI Ethernet Interface";
const ONBOARD_SUFFIX: &str = "-node_eth";

pub(crate) async fn discover(
    ctx: &DiscoveryContext<'_>,
    system: &ComputerSystem,
    agg: &mut SystemAggregate,
) {
    ncsi_interfaces(ctx, system, agg).await;
    standard::processors(ctx, system, agg).await;
}

/// `{endpoint}/ncsi-{member}-{package}-{channel}`, plus the onboard suffix.
pub(crate) fn interface_id(
    endpoint: &str,
    member: &str,
    package: &str,
    channel: u32,
    onboard: bool,
) -> String {
    let mut id = format!("{}/ncsi-{}-{}-{}", endpoint, member, package, channel);
    if onboard {
        id.push_str(ONBOARD_SUFFIX);
    }
    id
}

async fn ncsi_interfaces(
    ctx: &DiscoveryContext<'_>,
    system: &ComputerSystem,
    agg: &mut SystemAggregate,
) {
    let link = system.insyde_ncsi().map(|l| l.odata_id.clone());
    let mut subtree = SubtreeOutcome::new("InsydeNcsi", link.clone());

    let members = match link {
        Some(path) => open_collection(ctx, agg, &mut subtree, &path, &[""]).await,
        None => {
            debug!(endpoint = %ctx.endpoint.id, "No Insyde NCSI extension on system");
            None
        }
    };

    for member in members.unwrap_or_default() {
        ncsi_member(ctx, &member, agg, &mut subtree).await;
    }

    agg.finish_subtree(subtree);
}

async fn ncsi_member(
    ctx: &DiscoveryContext<'_>,
    member: &Member,
    agg: &mut SystemAggregate,
    subtree: &mut SubtreeOutcome,
) {
    let mut member_state = ResourceState::new(member.path());
    let ncsi = match ctx.fetch::<NcsiMember>(&mut member_state).await {
        Ok(fetched) => fetched.value,
        Err(e) => {
            warn!(path = %member.path(), error = %e, "NCSI member fetch failed");
            subtree.absorb(member_state.status());
            agg.track(member_state);
            return;
        }
    };

    let mut packages: Vec<&ResourceId> = ncsi
        .packages
        .iter()
        .filter(|p| !p.odata_id.trim().is_empty())
        .collect();
    packages.sort_by(|a, b| {
        trailing_number(a.last_segment())
            .unwrap_or(u64::MAX)
            .cmp(&trailing_number(b.last_segment()).unwrap_or(u64::MAX))
            .then_with(|| a.odata_id.cmp(&b.odata_id))
    });

    member_state.verify_ok();
    subtree.absorb(member_state.status());
    agg.track(member_state);

    let Some(package_link) = packages.first() else {
        debug!(path = %member.path(), "NCSI member has no package");
        return;
    };

    let member_key = member.key();
    let firmware_name = ncsi.version.firmware_name.trim().to_string();
    let onboard = ctx.config.is_onboard(&firmware_name);

    let mut package_state = ResourceState::new(package_link.odata_id.as_str());
    let fetched = match ctx.fetch::<NcsiPackage>(&mut package_state).await {
        Ok(fetched) => fetched,
        Err(e) => {
            warn!(path = %package_link.odata_id, error = %e, "NCSI package fetch failed");
            subtree.absorb(package_state.status());
            agg.track(package_state);
            return;
        }
    };
    package_state.verifying();

    let package = fetched.value;
    let package_key = trailing_number(package_link.last_segment())
        .map(|n| n.to_string())
        .unwrap_or_else(|| normalized_segment(package_link.last_segment()));

    let mut channels = package.channels.clone();
    channels.sort_by_key(|c| c.channel_index);

    let mut verification_error = None;
    for channel in &channels {
        let Some(mac) = populated(channel.mac_address.as_deref()) else {
            continue;
        };
        let mac = match normalize_mac(mac) {
            Ok(mac) => mac,
            Err(reason) => {
                warn!(
                    path = %package_link.odata_id,
                    channel = channel.channel_index,
                    %reason,
                    "NCSI channel failed verification"
                );
                verification_error.get_or_insert(reason);
                continue;
            }
        };

        let id = interface_id(
            ctx.endpoint.id.as_str(),
            member_key,
            &package_key,
            channel.channel_index,
            onboard,
        );
        let mut record = ComponentRecord::new(
            id,
            ComponentKind::NodeEnetInterface,
            &ctx.endpoint.id,
            package_link.odata_id.as_str(),
        )
        .with_attribute(ATTR_MAC, mac)
        .with_attribute(ATTR_DESCRIPTION, DESCRIPTION)
        .with_attribute(ATTR_CHANNEL, channel.channel_index.to_string())
        .with_raw(fetched.raw.clone());
        if !firmware_name.is_empty() {
            record = record.with_attribute(ATTR_FIRMWARE_NAME, firmware_name.as_str());
        }
        if onboard {
            record = record.with_attribute(ATTR_ROLE, ROLE_ONBOARD);
        }

        if agg.insert(record) {
            subtree.contributed += 1;
        } else {
            verification_error.get_or_insert_with(|| "duplicate component id".to_string());
        }
    }

    match verification_error {
        Some(reason) => {
            package_state.decode_failed(reason);
        }
        None => {
            package_state.verified();
        }
    }
    subtree.absorb(package_state.status());
    agg.track(package_state);
}

//! Static network reads for SUMO
//!
//! The network is read over TraCI in a few batched round trips into
//! [`SumoNetworkReads`], then translated into a [`NetworkDescription`] by a
//! pure function so the translation can be tested without a simulator.

use log::{debug, warn};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};

use super::traci::{
    GetRequest, TraciConnection, TraciValue, CMD_GET_EDGE_VARIABLE, CMD_GET_JUNCTION_VARIABLE,
    CMD_GET_LANE_VARIABLE, CMD_GET_TL_VARIABLE, FROM_JUNCTION, ID_LIST, LANE_EDGE_ID, LANE_LINKS,
    TL_COMPLETE_DEFINITION_RYG, TL_CONTROLLED_JUNCTIONS, TL_CONTROLLED_LINKS, TL_CURRENT_PROGRAM,
    TO_JUNCTION, VAR_LENGTH, VAR_MAXSPEED, VAR_POSITION, VAR_WIDTH,
};
use crate::backend::{
    BackendError, BackendResult, ConnectionDesc, EdgeDesc, JunctionDesc, LaneDesc,
    NetworkDescription, PhaseDesc, SignalPlanDesc,
};
use crate::simulation::{Position, TurnDirection};

/// Items per link in a `LANE_LINKS` compound
const LANE_LINK_FIELDS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct SumoEdge {
    pub id: String,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SumoLink {
    pub to_lane: String,
    /// Empty when the network has no internal lanes
    pub via: String,
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SumoLane {
    pub id: String,
    pub edge: String,
    pub length: f64,
    pub width: f64,
    pub max_speed: f64,
    pub links: Vec<SumoLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SumoPhase {
    pub duration: f64,
    /// One RYG char per signal index
    pub state: String,
}

/// A controlled link: (incoming lane, outgoing lane, via lane)
pub type ControlledLink = (String, String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct SumoTrafficLight {
    pub id: String,
    pub junctions: Vec<String>,
    /// Links per signal index
    pub controlled_links: Vec<Vec<ControlledLink>>,
    pub phases: Vec<SumoPhase>,
}

/// Raw TraCI reads that make up SUMO's static network
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SumoNetworkReads {
    pub junctions: Vec<(String, Position)>,
    pub edges: Vec<SumoEdge>,
    pub lanes: Vec<SumoLane>,
    pub traffic_lights: Vec<SumoTrafficLight>,
}

fn is_internal(id: &str) -> bool {
    id.starts_with(':')
}

/// Map SUMO's link direction char onto a turn direction
pub fn link_direction(dir: &str) -> Option<TurnDirection> {
    match dir {
        "s" => Some(TurnDirection::Through),
        "l" | "L" => Some(TurnDirection::Left),
        "r" | "R" => Some(TurnDirection::Right),
        "t" | "T" => Some(TurnDirection::UTurn),
        _ => None,
    }
}

/// Lane index from a SUMO lane id (`<edge>_<index>`)
fn lane_index(lane: &str) -> usize {
    lane.rsplit_once('_')
        .and_then(|(_, index)| index.parse().ok())
        .unwrap_or(0)
}

/// Signal indices that are green (`G` major, `g` minor) in an RYG state
pub fn green_indices(state: &str) -> Vec<usize> {
    state
        .chars()
        .enumerate()
        .filter(|(_, c)| matches!(c, 'G' | 'g'))
        .map(|(i, _)| i)
        .collect()
}

impl SumoNetworkReads {
    /// Translate the reads into a backend-neutral description
    pub fn into_description(self) -> NetworkDescription {
        let junctions = self
            .junctions
            .into_iter()
            .filter(|(id, _)| !is_internal(id))
            .map(|(id, position)| JunctionDesc { id, position })
            .collect();

        let edges = self
            .edges
            .into_iter()
            .filter(|e| !is_internal(&e.id))
            .map(|e| EdgeDesc {
                id: e.id,
                from: e.from,
                to: e.to,
            })
            .collect();

        // Where each internal lane leads when it is not the last of its crossing
        let next_internal: HashMap<&str, &str> = self
            .lanes
            .iter()
            .filter(|lane| is_internal(&lane.id))
            .filter_map(|lane| {
                let link = lane.links.first()?;
                let next = if !link.via.is_empty() {
                    &link.via
                } else {
                    &link.to_lane
                };
                is_internal(next).then_some((lane.id.as_str(), next.as_str()))
            })
            .collect();

        let mut lanes = Vec::with_capacity(self.lanes.len());
        let mut connections = Vec::new();
        for lane in &self.lanes {
            let internal = is_internal(&lane.id) || is_internal(&lane.edge);
            lanes.push(LaneDesc {
                id: lane.id.clone(),
                edge: (!internal).then(|| lane.edge.clone()),
                index: lane_index(&lane.id),
                length: lane.length,
                width: lane.width,
                speed_limit: lane.max_speed,
            });
            if internal {
                continue;
            }
            for link in &lane.links {
                if is_internal(&link.to_lane) {
                    continue;
                }
                let via = (!link.via.is_empty()).then(|| link.via.clone());
                let via_chain = via
                    .as_deref()
                    .map(|first| internal_chain(&next_internal, first))
                    .unwrap_or_default();
                connections.push(ConnectionDesc {
                    from_lane: lane.id.clone(),
                    to_lane: link.to_lane.clone(),
                    via,
                    via_chain,
                    direction: link_direction(&link.direction),
                });
            }
        }

        let mut description = NetworkDescription {
            junctions,
            edges,
            lanes,
            connections,
            signals: Vec::new(),
        };
        description.signals = self
            .traffic_lights
            .iter()
            .filter_map(|tls| signal_plan(tls, &description))
            .collect();
        description
    }
}

/// Internal lanes following `first` up to the exit lane
fn internal_chain(next_internal: &HashMap<&str, &str>, first: &str) -> Vec<String> {
    let mut chain: Vec<String> = Vec::new();
    let mut current = first;
    while let Some(&next) = next_internal.get(current) {
        if next == first || chain.iter().any(|lane| lane == next) {
            warn!("Internal lanes after {first} form a cycle, truncating at {next}");
            break;
        }
        chain.push(next.to_string());
        current = next;
    }
    chain
}

/// Phases of one traffic light as a plan at its (first) controlled junction.
///
/// A program spanning several junctions keeps all of them in its phases, which
/// the network builder rejects as foreign connections.
fn signal_plan(tls: &SumoTrafficLight, desc: &NetworkDescription) -> Option<SignalPlanDesc> {
    let Some(junction) = tls.junctions.first() else {
        warn!("Traffic light {} controls no junction, ignoring it", tls.id);
        return None;
    };

    let phases = tls
        .phases
        .iter()
        .map(|phase| {
            let mut permitted: Vec<usize> = green_indices(&phase.state)
                .into_iter()
                .filter_map(|signal| tls.controlled_links.get(signal))
                .flatten()
                .filter_map(|(from, to, _)| desc.connection_index(from, to))
                .collect();
            permitted.sort_unstable();
            permitted.dedup();
            PhaseDesc {
                duration: phase.duration,
                permitted,
            }
        })
        .collect();

    Some(SignalPlanDesc {
        intersection: junction.clone(),
        phases,
    })
}

/// Map of traffic light id to the junction its plan is attached to
pub fn read_tls_junctions<S: Read + Write>(
    conn: &mut TraciConnection<S>,
) -> BackendResult<BTreeMap<String, String>> {
    let ids = conn
        .get(CMD_GET_TL_VARIABLE, ID_LIST, "")?
        .into_string_list()?;
    let requests: Vec<GetRequest> = ids
        .iter()
        .map(|id| GetRequest::new(CMD_GET_TL_VARIABLE, TL_CONTROLLED_JUNCTIONS, id.as_str()))
        .collect();
    let values = conn.get_batch(&requests)?;

    let mut map = BTreeMap::new();
    for (id, value) in ids.into_iter().zip(values) {
        match value.into_string_list()?.into_iter().next() {
            Some(junction) => {
                map.insert(id, junction);
            }
            None => warn!("Traffic light {id} controls no junction"),
        }
    }
    Ok(map)
}

/// Read the full static network over an open connection
pub fn read<S: Read + Write>(conn: &mut TraciConnection<S>) -> BackendResult<SumoNetworkReads> {
    let junction_ids = conn
        .get(CMD_GET_JUNCTION_VARIABLE, ID_LIST, "")?
        .into_string_list()?;
    let positions = conn.get_batch(
        &junction_ids
            .iter()
            .map(|id| GetRequest::new(CMD_GET_JUNCTION_VARIABLE, VAR_POSITION, id.as_str()))
            .collect::<Vec<_>>(),
    )?;
    let junctions = junction_ids
        .into_iter()
        .zip(positions)
        .map(|(id, pos)| Ok((id, pos.as_position()?)))
        .collect::<BackendResult<Vec<_>>>()?;

    let edge_ids: Vec<String> = conn
        .get(CMD_GET_EDGE_VARIABLE, ID_LIST, "")?
        .into_string_list()?
        .into_iter()
        .filter(|id| !is_internal(id))
        .collect();
    let mut edge_requests = Vec::with_capacity(edge_ids.len() * 2);
    for id in &edge_ids {
        edge_requests.push(GetRequest::new(CMD_GET_EDGE_VARIABLE, FROM_JUNCTION, id.as_str()));
        edge_requests.push(GetRequest::new(CMD_GET_EDGE_VARIABLE, TO_JUNCTION, id.as_str()));
    }
    let mut edge_values = conn.get_batch(&edge_requests)?.into_iter();
    let mut edges = Vec::with_capacity(edge_ids.len());
    for id in edge_ids {
        let from = next_value(&mut edge_values)?.into_string()?;
        let to = next_value(&mut edge_values)?.into_string()?;
        edges.push(SumoEdge { id, from, to });
    }

    let lane_ids = conn
        .get(CMD_GET_LANE_VARIABLE, ID_LIST, "")?
        .into_string_list()?;
    const LANE_VARS: [u8; 5] = [LANE_EDGE_ID, VAR_LENGTH, VAR_WIDTH, VAR_MAXSPEED, LANE_LINKS];
    let lane_requests: Vec<GetRequest> = lane_ids
        .iter()
        .flat_map(|id| {
            LANE_VARS
                .iter()
                .map(move |var| GetRequest::new(CMD_GET_LANE_VARIABLE, *var, id.as_str()))
        })
        .collect();
    let mut lane_values = conn.get_batch(&lane_requests)?.into_iter();
    let mut lanes = Vec::with_capacity(lane_ids.len());
    for id in lane_ids {
        let edge = next_value(&mut lane_values)?.into_string()?;
        let length = next_value(&mut lane_values)?.as_double()?;
        let width = next_value(&mut lane_values)?.as_double()?;
        let max_speed = next_value(&mut lane_values)?.as_double()?;
        let links = parse_lane_links(next_value(&mut lane_values)?)?;
        lanes.push(SumoLane {
            id,
            edge,
            length,
            width,
            max_speed,
            links,
        });
    }

    let tls_ids = conn
        .get(CMD_GET_TL_VARIABLE, ID_LIST, "")?
        .into_string_list()?;
    const TLS_VARS: [u8; 4] = [
        TL_CONTROLLED_JUNCTIONS,
        TL_CONTROLLED_LINKS,
        TL_CURRENT_PROGRAM,
        TL_COMPLETE_DEFINITION_RYG,
    ];
    let tls_requests: Vec<GetRequest> = tls_ids
        .iter()
        .flat_map(|id| {
            TLS_VARS
                .iter()
                .map(move |var| GetRequest::new(CMD_GET_TL_VARIABLE, *var, id.as_str()))
        })
        .collect();
    let mut tls_values = conn.get_batch(&tls_requests)?.into_iter();
    let mut traffic_lights = Vec::with_capacity(tls_ids.len());
    for id in tls_ids {
        let junctions = next_value(&mut tls_values)?.into_string_list()?;
        let controlled_links = parse_controlled_links(next_value(&mut tls_values)?)?;
        let program = next_value(&mut tls_values)?.into_string()?;
        let phases = parse_program_phases(next_value(&mut tls_values)?, &program)?;
        traffic_lights.push(SumoTrafficLight {
            id,
            junctions,
            controlled_links,
            phases,
        });
    }

    debug!(
        "Read SUMO network: {} junctions, {} edges, {} lanes, {} traffic lights",
        junctions.len(),
        edges.len(),
        lanes.len(),
        traffic_lights.len()
    );
    Ok(SumoNetworkReads {
        junctions,
        edges,
        lanes,
        traffic_lights,
    })
}

fn next_value(values: &mut impl Iterator<Item = TraciValue>) -> BackendResult<TraciValue> {
    values
        .next()
        .ok_or_else(|| BackendError::Protocol("batched response ended early".to_string()))
}

/// Decode a `LANE_LINKS` compound
pub fn parse_lane_links(value: TraciValue) -> BackendResult<Vec<SumoLink>> {
    let mut items = value.into_compound()?.into_iter();
    let count = usize::try_from(next_value(&mut items)?.as_int()?).unwrap_or(0);
    let mut links = Vec::with_capacity(count);
    for _ in 0..count {
        let fields: Vec<TraciValue> = items.by_ref().take(LANE_LINK_FIELDS).collect();
        if fields.len() != LANE_LINK_FIELDS {
            return Err(BackendError::Protocol(
                "lane link compound ended early".to_string(),
            ));
        }
        links.push(SumoLink {
            to_lane: fields[0].as_str()?.to_string(),
            via: fields[1].as_str()?.to_string(),
            direction: fields[6].as_str()?.to_string(),
        });
    }
    Ok(links)
}

/// Decode a `TL_CONTROLLED_LINKS` compound into links per signal index
pub fn parse_controlled_links(value: TraciValue) -> BackendResult<Vec<Vec<ControlledLink>>> {
    let mut items = value.into_compound()?.into_iter();
    let signals = usize::try_from(next_value(&mut items)?.as_int()?).unwrap_or(0);
    let mut out = Vec::with_capacity(signals);
    for _ in 0..signals {
        let count = usize::try_from(next_value(&mut items)?.as_int()?).unwrap_or(0);
        let mut links = Vec::with_capacity(count);
        for _ in 0..count {
            let link = next_value(&mut items)?.into_string_list()?;
            match <[String; 3]>::try_from(link) {
                Ok([from, to, via]) => links.push((from, to, via)),
                Err(link) => {
                    return Err(BackendError::Protocol(format!(
                        "controlled link should have 3 lanes, got {link:?}"
                    )))
                }
            }
        }
        out.push(links);
    }
    Ok(out)
}

/// Decode `TL_COMPLETE_DEFINITION_RYG` and keep the phases of `program`
///
/// Falls back to the first logic when the program id is not listed.
pub fn parse_program_phases(value: TraciValue, program: &str) -> BackendResult<Vec<SumoPhase>> {
    let mut logics: HashMap<String, Vec<SumoPhase>> = HashMap::new();
    let mut first = None;

    for logic in value.into_compound()? {
        let mut fields = logic.into_compound()?.into_iter();
        let program_id = next_value(&mut fields)?.into_string()?;
        let _logic_type = next_value(&mut fields)?;
        let _current_phase = next_value(&mut fields)?;
        let phases = next_value(&mut fields)?
            .into_compound()?
            .into_iter()
            .map(|phase| {
                let mut parts = phase.into_compound()?.into_iter();
                let duration = next_value(&mut parts)?.as_double()?;
                let state = next_value(&mut parts)?.into_string()?;
                Ok(SumoPhase { duration, state })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        if first.is_none() {
            first = Some(program_id.clone());
        }
        logics.insert(program_id, phases);
    }

    if let Some(phases) = logics.remove(program) {
        return Ok(phases);
    }
    match first.and_then(|id| logics.remove(&id)) {
        Some(phases) => {
            warn!("Program {program:?} not found in signal definition, using the first logic");
            Ok(phases)
        }
        None => Ok(Vec::new()),
    }
}

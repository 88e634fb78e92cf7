//! Protocol command table and dispatch.
//!
//! One line, one command, one `OK -`/`ERR -` acknowledgement. The first
//! whitespace-separated token selects the command (ASCII
//! case-insensitive); the remainder splits on commas, the protocol's
//! hard separator.

use core_lut::MAX_DEPTH_INDEX;
use core_zones::{parse_num, ZoneError};
use tracing::debug;

use crate::client::Outbound;
use crate::ServerState;

/// Protocol version reported by `ver`.
pub const PROTOCOL_VERSION: u32 = 2;

pub(crate) struct CommandSpec {
    pub name: &'static str,
    pub desc: &'static str,
}

pub(crate) const COMMANDS: &[CommandSpec] = &[
    CommandSpec { name: "addzone", desc: "addzone name,x1,y1,z1,x2,y2,z2 - add a zone (mm)" },
    CommandSpec { name: "setzone", desc: "setzone name,all,x1,..,z2 or name,attr,value - update a zone" },
    CommandSpec { name: "rmzone", desc: "rmzone name - remove a zone" },
    CommandSpec { name: "clear", desc: "clear - remove all zones" },
    CommandSpec { name: "zones", desc: "zones - list all zones" },
    CommandSpec { name: "sub", desc: "sub - subscribe to zone status updates" },
    CommandSpec { name: "unsub", desc: "unsub - cancel the status subscription" },
    CommandSpec { name: "getdepth", desc: "getdepth - request one depth frame" },
    CommandSpec { name: "subdepth", desc: "subdepth [count] - subscribe to depth frames" },
    CommandSpec { name: "unsubdepth", desc: "unsubdepth - cancel the depth subscription" },
    CommandSpec { name: "getvideo", desc: "getvideo - request one video frame" },
    CommandSpec { name: "getbright", desc: "getbright - request zone brightness once" },
    CommandSpec { name: "tilt", desc: "tilt [deg] - read or set the motor tilt" },
    CommandSpec { name: "fps", desc: "fps - report the processed depth frame rate" },
    CommandSpec { name: "lut", desc: "lut [index] - depth table entry or whole table" },
    CommandSpec { name: "sa", desc: "sa [index] - surface table entry or whole table" },
    CommandSpec { name: "ver", desc: "ver - report the protocol version" },
    CommandSpec { name: "help", desc: "help - list commands" },
    CommandSpec { name: "bye", desc: "bye - close the connection" },
];

/// Execute one inbound line for one client.
pub(crate) fn execute(state: &mut ServerState, id: u64, line: &str) {
    let line = line.trim_start();
    let (cmd, args) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim_start()),
        None => (line, ""),
    };
    if cmd.is_empty() {
        return;
    }
    debug!(target: "server.command", id, cmd, "command");
    let cmd_lower = cmd.to_ascii_lowercase();
    match cmd_lower.as_str() {
        "bye" => cmd_bye(state, id),
        "ver" => state.push_line(id, format!("OK - Version {PROTOCOL_VERSION}")),
        "help" => cmd_help(state, id),
        "addzone" => cmd_addzone(state, id, args),
        "setzone" => cmd_setzone(state, id, args),
        "rmzone" => cmd_rmzone(state, id, args),
        "clear" => cmd_clear(state, id),
        "zones" => cmd_zones(state, id),
        "sub" => cmd_sub(state, id),
        "unsub" => cmd_unsub(state, id),
        "getdepth" => cmd_getdepth(state, id),
        "subdepth" => cmd_subdepth(state, id, args),
        "unsubdepth" => cmd_unsubdepth(state, id),
        "getvideo" => cmd_getvideo(state, id),
        "getbright" => cmd_getbright(state, id),
        "tilt" => cmd_tilt(state, id, args),
        "fps" => cmd_fps(state, id),
        "lut" => cmd_table(state, id, args, false),
        "sa" => cmd_table(state, id, args, true),
        _ => state.push_line(id, format!("ERR - Unknown command \"{cmd}\"")),
    }
}

fn zone_error_reply(e: &ZoneError) -> String {
    match e {
        ZoneError::Duplicate(n) => format!("ERR - Zone \"{n}\" already exists."),
        ZoneError::NotFound(n) => format!("ERR - No zone named \"{n}\"."),
        ZoneError::InvalidName(n) => format!("ERR - Invalid zone name \"{n}\"."),
        ZoneError::BadBox => "ERR - Invalid zone box.".to_string(),
        ZoneError::InvalidAttr(k) => format!("ERR - Unknown attribute \"{k}\"."),
        ZoneError::ReadOnlyAttr(k) => format!("ERR - Attribute \"{k}\" is read-only."),
        ZoneError::InvalidValue(v) => format!("ERR - Invalid value \"{v}\"."),
    }
}

fn cmd_bye(state: &mut ServerState, id: u64) {
    state.push_line(id, "OK - Goodbye".to_string());
    if let Some(client) = state.clients.get_mut(&id) {
        client.shutting_down = true;
    }
    state.push(id, Outbound::Shutdown);
}

fn cmd_help(state: &mut ServerState, id: u64) {
    state.push_line(
        id,
        format!(
            "OK - {} commands (app version {})",
            COMMANDS.len(),
            state.ctx.app_version
        ),
    );
    for spec in COMMANDS {
        state.push_line(id, format!("{} - {}", spec.name, spec.desc));
    }
}

fn cmd_addzone(state: &mut ServerState, id: u64, args: &str) {
    let fields: Vec<&str> = args.split(',').collect();
    if fields.len() != 7 || fields[0].is_empty() {
        state.push_line(
            id,
            "ERR - Usage: addzone name,x1,y1,z1,x2,y2,z2".to_string(),
        );
        return;
    }
    let name = fields[0];
    let mut corners = [0i32; 6];
    for (slot, raw) in corners.iter_mut().zip(&fields[1..]) {
        *slot = parse_num(raw).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    }
    match state.ctx.catalog.add(name, corners) {
        Ok(()) => {
            state.push_line(id, format!("OK - Zone \"{name}\" was added."));
            if let Some(record) = state.record_of(name) {
                state.broadcast_global(format!("ADD - {record}"));
            }
        }
        Err(e) => state.push_line(id, zone_error_reply(&e)),
    }
}

fn cmd_setzone(state: &mut ServerState, id: u64, args: &str) {
    let fields: Vec<&str> = args.split(',').collect();
    let reply = if fields.len() == 8 && fields[1].trim().eq_ignore_ascii_case("all") {
        let name = fields[0];
        let mut corners = [0i32; 6];
        for (slot, raw) in corners.iter_mut().zip(&fields[2..]) {
            *slot = parse_num(raw).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        }
        match state.ctx.catalog.set_box(name, corners) {
            Ok(()) => format!("OK - Zone \"{name}\" updated."),
            Err(e) => zone_error_reply(&e),
        }
    } else if fields.len() == 3 {
        let (name, key, value) = (fields[0], fields[1].trim(), fields[2]);
        match state.ctx.catalog.set_attr(name, key, value) {
            Ok(()) => format!("OK - Zone \"{name}\" updated."),
            Err(e) => zone_error_reply(&e),
        }
    } else {
        "ERR - Usage: setzone name,all,x1,..,z2 or setzone name,attr,value".to_string()
    };
    // No ambient broadcast; the next status update carries the change.
    state.push_line(id, reply);
}

fn cmd_rmzone(state: &mut ServerState, id: u64, args: &str) {
    let name = args.split(',').next().unwrap_or("");
    if name.is_empty() {
        state.push_line(id, "ERR - Usage: rmzone name".to_string());
        return;
    }
    // Subscribers hear about the zone while it still exists.
    if state.ctx.catalog.find_by_name(name) {
        state.broadcast_global(format!("DEL - {name}"));
    }
    match state.ctx.catalog.remove(name) {
        Ok(()) => state.push_line(id, format!("OK - Zone \"{name}\" was removed.")),
        Err(e) => state.push_line(id, zone_error_reply(&e)),
    }
}

fn cmd_clear(state: &mut ServerState, id: u64) {
    let names: Vec<String> = {
        let g = state.ctx.catalog.lock();
        g.zones().iter().map(|z| z.name.clone()).collect()
    };
    for name in &names {
        state.broadcast_global(format!("DEL - {name}"));
    }
    state.ctx.catalog.clear();
    state.push_line(id, format!("OK - Cleared {} zones.", names.len()));
}

fn cmd_zones(state: &mut ServerState, id: u64) {
    let (header, records) = {
        let g = state.ctx.catalog.lock();
        let occupied = g.occupied_live();
        let peak_idx = g.max_zone;
        let peak_name = if peak_idx >= 0 {
            g.zones()
                .get(peak_idx as usize)
                .map(|z| z.name.clone())
                .unwrap_or_else(|| "[none]".to_string())
        } else {
            "[none]".to_string()
        };
        let header = format!(
            "OK - {} zones - Version {}, {} occupied, peak zone is {} \"{}\"",
            g.zones().len(),
            g.version(),
            occupied,
            peak_idx,
            peak_name,
        );
        let records: Vec<String> = g.zones().iter().map(|z| z.format_record(true)).collect();
        (header, records)
    };
    state.push_line(id, header);
    for record in records {
        state.push_line(id, record);
    }
}

fn cmd_sub(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        client.subglobal = true;
    }
    state.push_line(id, "OK - Subscribed to zone updates.".to_string());
    // Initial dump: one full SUB record per existing zone, ahead of any
    // frame-driven differential update.
    let records: Vec<String> = {
        let g = state.ctx.catalog.lock();
        g.zones()
            .iter()
            .map(|z| format!("SUB - {}", z.format_record(true)))
            .collect()
    };
    for record in records {
        state.push_line(id, record);
    }
}

fn cmd_unsub(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        client.subglobal = false;
    }
    state.push_line(id, "OK - Unsubscribed from zone updates.".to_string());
}

fn cmd_getdepth(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        if client.subdepth {
            if client.depth_budget > 0 {
                client.depth_budget += 1;
            }
        } else {
            client.subdepth = true;
            client.depth_budget = 1;
        }
    }
    state.push_line(id, "OK - Depth frame queued.".to_string());
}

fn cmd_subdepth(state: &mut ServerState, id: u64, args: &str) {
    let count = if args.trim().is_empty() {
        0
    } else {
        parse_num(args).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    };
    if let Some(client) = state.clients.get_mut(&id) {
        client.subdepth = true;
        client.depth_budget = count.max(0); // 0 and below mean unlimited
    }
    if count > 0 {
        state.push_line(id, format!("OK - Subscribed to {count} depth frames."));
    } else {
        state.push_line(id, "OK - Subscribed to depth frames.".to_string());
    }
}

fn cmd_unsubdepth(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        client.subdepth = false;
        client.depth_budget = 0;
    }
    state.push_line(id, "OK - Depth subscription cancelled.".to_string());
}

fn cmd_getvideo(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        client.subvideo = true;
    }
    state.ctx.commands.set_video_requested(true);
    state.push_line(id, "OK - Video frame queued.".to_string());
}

fn cmd_getbright(state: &mut ServerState, id: u64) {
    if let Some(client) = state.clients.get_mut(&id) {
        client.subbright = true;
    }
    state.ctx.commands.set_video_requested(true);
    state.push_line(id, "OK - Brightness queued.".to_string());
}

fn cmd_tilt(state: &mut ServerState, id: u64, args: &str) {
    let reply = if args.trim().is_empty() {
        format!("OK - Tilt {}", state.ctx.commands.tilt())
    } else {
        let deg = parse_num(args).clamp(-90, 90) as i32;
        let applied = state.ctx.commands.request_tilt(deg);
        format!("OK - Tilt set to {applied}")
    };
    state.push_line(id, reply);
}

fn cmd_fps(state: &mut ServerState, id: u64) {
    let x100 = state.ctx.fps.fps_x100();
    state.push_line(id, format!("OK - {}.{:02} fps", x100 / 100, x100 % 100));
}

fn cmd_table(state: &mut ServerState, id: u64, args: &str, surface: bool) {
    let luts = state.ctx.catalog.luts();
    let label = if surface { "sa" } else { "lut" };
    let entry = |i: u16| -> i64 {
        if surface {
            luts.surface_mm2(i) as i64
        } else {
            i64::from(luts.depth_mm(i))
        }
    };
    if args.trim().is_empty() {
        let mut line = String::with_capacity(8 * usize::from(MAX_DEPTH_INDEX));
        line.push_str("OK -");
        for i in 0..=MAX_DEPTH_INDEX {
            line.push(' ');
            line.push_str(&entry(i).to_string());
        }
        state.push_line(id, line);
        return;
    }
    let idx = parse_num(args);
    if idx < 0 || idx > i64::from(MAX_DEPTH_INDEX) {
        state.push_line(
            id,
            format!("ERR - Index out of range (0..{MAX_DEPTH_INDEX})"),
        );
        return;
    }
    let idx = idx as u16;
    state.push_line(id, format!("OK - {label}[{idx}] = {}", entry(idx)));
}

//! Command execution.
//!
//! `Connection::run` is the single dispatch point: top-level commands reach
//! it through the gates in `connection.rs`, and `EXEC` re-runs its queued
//! commands through it with `in_exec = true`. Replies are raw bytes so EXEC
//! can concatenate them verbatim into its response array.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use kv_wire::{Frame, keyword_eq};

use crate::connection::{Command, Connection};
use crate::store::{StoreError, StreamEntry, parse_read_cursor};

/// How long `XREAD BLOCK 0` parks before reporting nothing: one re-check
/// unit rather than an unbounded wait.
const XREAD_BLOCK_UNIT_MS: u64 = 1000;

/// Poll cadence of the `WAIT` barrier.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn store_err(e: &StoreError) -> Vec<u8> {
    Frame::Error(e.to_string()).encode()
}

fn wrong_args(name: &str) -> Vec<u8> {
    kv_wire::encode_error(&format!(
        "wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn syntax_err() -> Vec<u8> {
    kv_wire::encode_error("syntax error")
}

impl Connection {
    pub(crate) async fn run(&mut self, command: &Command, in_exec: bool) -> Vec<u8> {
        let args = command.args.as_slice();
        match command.name.to_ascii_uppercase().as_str() {
            "COMMAND" => kv_wire::empty_array(),
            "PING" => {
                if self.subscribed.is_empty() {
                    kv_wire::encode_simple("PONG")
                } else {
                    kv_wire::encode_bulk_array(&["pong", ""])
                }
            }
            "ECHO" => match args {
                [value] => kv_wire::encode_bulk(value),
                _ => wrong_args("echo"),
            },
            "QUIT" => kv_wire::encode_simple("OK"),
            "SET" => self.cmd_set(args).await,
            "GET" => match args {
                [key] => match self.state.store.get(key).await {
                    Some(value) => kv_wire::encode_bulk(&value),
                    None => kv_wire::null_bulk(),
                },
                _ => wrong_args("get"),
            },
            "INCR" => match args {
                [key] => match self.state.store.incr(key).await {
                    Ok(n) => kv_wire::encode_int(n),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("incr"),
            },
            "RPUSH" => match args {
                [key, values @ ..] if !values.is_empty() => {
                    match self.state.store.rpush(key, values.to_vec()).await {
                        Ok(len) => kv_wire::encode_int(len as i64),
                        Err(e) => store_err(&e),
                    }
                }
                _ => wrong_args("rpush"),
            },
            "LPUSH" => match args {
                [key, values @ ..] if !values.is_empty() => {
                    match self.state.store.lpush(key, values.to_vec()).await {
                        Ok(len) => kv_wire::encode_int(len as i64),
                        Err(e) => store_err(&e),
                    }
                }
                _ => wrong_args("lpush"),
            },
            "LRANGE" => match args {
                [key, start, stop] => {
                    let (Ok(start), Ok(stop)) = (start.parse::<i64>(), stop.parse::<i64>()) else {
                        return store_err(&StoreError::NotAnInteger);
                    };
                    match self.state.store.lrange(key, start, stop).await {
                        Ok(items) => kv_wire::encode_bulk_array(&items),
                        Err(e) => store_err(&e),
                    }
                }
                _ => wrong_args("lrange"),
            },
            "LLEN" => match args {
                [key] => match self.state.store.llen(key).await {
                    Ok(len) => kv_wire::encode_int(len as i64),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("llen"),
            },
            "LPOP" => self.cmd_lpop(args).await,
            "BLPOP" => self.cmd_blpop(args, in_exec).await,
            "TYPE" => match args {
                [key] => kv_wire::encode_simple(self.state.store.type_name(key).await),
                _ => wrong_args("type"),
            },
            "XADD" => self.cmd_xadd(args).await,
            "XRANGE" => match args {
                [key, start, end] => match self.state.store.xrange(key, start, end).await {
                    Ok(entries) => entries_frame(&entries).encode(),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("xrange"),
            },
            "XREAD" => self.cmd_xread(args, in_exec).await,
            "MULTI" => {
                self.in_transaction = true;
                kv_wire::encode_simple("OK")
            }
            "DISCARD" => {
                if self.in_transaction {
                    self.in_transaction = false;
                    self.queued.clear();
                    kv_wire::encode_simple("OK")
                } else {
                    kv_wire::encode_error("DISCARD without MULTI")
                }
            }
            "INFO" => self.cmd_info(args).await,
            "REPLCONF" => self.cmd_replconf(args).await,
            "PSYNC" => self.cmd_psync().await,
            "WAIT" => self.cmd_wait(args, in_exec).await,
            "CONFIG" => self.cmd_config(args),
            "KEYS" => match args {
                [_pattern] => kv_wire::encode_bulk_array(&self.state.store.keys().await),
                _ => wrong_args("keys"),
            },
            "SUBSCRIBE" => self.cmd_subscribe(args).await,
            "UNSUBSCRIBE" => self.cmd_unsubscribe(args).await,
            "PUBLISH" => self.cmd_publish(args).await,
            "ZADD" => self.cmd_zadd(args).await,
            "ZRANK" => match args {
                [key, member] => match self.state.store.zrank(key, member).await {
                    Ok(Some(rank)) => kv_wire::encode_int(rank as i64),
                    Ok(None) => kv_wire::null_bulk(),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("zrank"),
            },
            "ZRANGE" => match args {
                [key, start, stop] => {
                    let (Ok(start), Ok(stop)) = (start.parse::<i64>(), stop.parse::<i64>()) else {
                        return store_err(&StoreError::NotAnInteger);
                    };
                    match self.state.store.zrange(key, start, stop).await {
                        Ok(members) => kv_wire::encode_bulk_array(&members),
                        Err(e) => store_err(&e),
                    }
                }
                _ => wrong_args("zrange"),
            },
            "ZCARD" => match args {
                [key] => match self.state.store.zcard(key).await {
                    Ok(len) => kv_wire::encode_int(len as i64),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("zcard"),
            },
            "ZSCORE" => match args {
                [key, member] => match self.state.store.zscore(key, member).await {
                    Ok(Some(score)) => kv_wire::encode_bulk(&format!("{score}")),
                    Ok(None) => kv_wire::null_bulk(),
                    Err(e) => store_err(&e),
                },
                _ => wrong_args("zscore"),
            },
            "GEOADD" => self.cmd_geoadd(args).await,
            "GEOPOS" => self.cmd_geopos(args).await,
            "GEODIST" => self.cmd_geodist(args).await,
            "GEOSEARCH" => self.cmd_geosearch(args).await,
            other => {
                debug!(command = other, "unhandled command");
                Vec::new()
            }
        }
    }

    async fn cmd_set(&self, args: &[String]) -> Vec<u8> {
        match args {
            [key, value] => {
                self.state.store.set(key, value.clone()).await;
                kv_wire::encode_simple("OK")
            }
            [key, value, option, amount] => {
                let Ok(mut ms) = amount.parse::<u64>() else {
                    return store_err(&StoreError::NotAnInteger);
                };
                if keyword_eq(option, "EX") {
                    ms *= 1000;
                } else if !keyword_eq(option, "PX") {
                    return syntax_err();
                }
                self.state
                    .store
                    .set_expire(key, value.clone(), Duration::from_millis(ms))
                    .await;
                kv_wire::encode_simple("OK")
            }
            [_, _, ..] => syntax_err(),
            _ => wrong_args("set"),
        }
    }

    async fn cmd_lpop(&self, args: &[String]) -> Vec<u8> {
        match args {
            [key] => match self.state.store.lpop(key).await {
                Ok(Some(value)) => kv_wire::encode_bulk(&value),
                Ok(None) => kv_wire::null_bulk(),
                Err(e) => store_err(&e),
            },
            [key, count] => {
                let Ok(count) = count.parse::<usize>() else {
                    return store_err(&StoreError::NotAnInteger);
                };
                match self.state.store.lpop_n(key, count).await {
                    Ok(Some(values)) => kv_wire::encode_bulk_array(&values),
                    Ok(None) => kv_wire::null_bulk(),
                    Err(e) => store_err(&e),
                }
            }
            _ => wrong_args("lpop"),
        }
    }

    async fn cmd_blpop(&self, args: &[String], in_exec: bool) -> Vec<u8> {
        let [key, timeout] = args else {
            return wrong_args("blpop");
        };
        let Ok(timeout_secs) = timeout.parse::<f64>() else {
            return kv_wire::encode_error("timeout is not a float or out of range");
        };
        if timeout_secs < 0.0 {
            return kv_wire::encode_error("timeout is negative");
        }

        // The immediate attempt runs under the EXEC gate like any other
        // command (inside EXEC the write guard is already held); the gate
        // is released only to actually park.
        let first = if in_exec {
            self.state.store.lpop(key).await
        } else {
            let gate = Arc::clone(&self.state.exec_gate);
            let _guard = gate.read().await;
            self.state.store.lpop(key).await
        };
        match first {
            Ok(Some(value)) => {
                return kv_wire::encode_bulk_array(&[key.as_str(), value.as_str()]);
            }
            Err(e) => return store_err(&e),
            Ok(None) => {}
        }
        if in_exec {
            // A transaction must not park while the queue drains.
            return kv_wire::null_array();
        }

        let timeout = (timeout_secs > 0.0).then(|| Duration::from_secs_f64(timeout_secs));
        match self.state.store.blpop(key, timeout).await {
            Ok(Some(value)) => kv_wire::encode_bulk_array(&[key.as_str(), value.as_str()]),
            Ok(None) => kv_wire::null_array(),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_xadd(&self, args: &[String]) -> Vec<u8> {
        let [key, id_spec, pairs @ ..] = args else {
            return wrong_args("xadd");
        };
        if pairs.is_empty() || pairs.len() % 2 != 0 {
            return wrong_args("xadd");
        }
        let fields = pairs
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        match self.state.store.xadd(key, id_spec, fields).await {
            Ok(id) => kv_wire::encode_bulk(&id.to_string()),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_xread(&self, args: &[String], in_exec: bool) -> Vec<u8> {
        let mut count: Option<usize> = None;
        let mut block_ms: Option<u64> = None;
        let mut streams_at: Option<usize> = None;
        let mut idx = 0;
        while idx < args.len() {
            if keyword_eq(&args[idx], "COUNT") {
                let Some(value) = args.get(idx + 1).and_then(|v| v.parse().ok()) else {
                    return store_err(&StoreError::NotAnInteger);
                };
                count = Some(value);
                idx += 2;
            } else if keyword_eq(&args[idx], "BLOCK") {
                let Some(value) = args.get(idx + 1).and_then(|v| v.parse().ok()) else {
                    return store_err(&StoreError::NotAnInteger);
                };
                block_ms = Some(value);
                idx += 2;
            } else if keyword_eq(&args[idx], "STREAMS") {
                streams_at = Some(idx);
                break;
            } else {
                return syntax_err();
            }
        }
        let Some(base) = streams_at else {
            return syntax_err();
        };
        let rest = &args[base + 1..];
        if rest.is_empty() || rest.len() % 2 != 0 {
            return kv_wire::encode_error(
                "Unbalanced XREAD list of streams: for each stream key an ID or '$' must be specified.",
            );
        }
        let half = rest.len() / 2;
        let keys = rest[..half].to_vec();
        let mut cursors = Vec::with_capacity(half);
        for spec in &rest[half..] {
            match parse_read_cursor(spec) {
                Ok(cursor) => cursors.push(cursor),
                Err(e) => return store_err(&e),
            }
        }

        // Without BLOCK (or inside EXEC, which must not park) the read runs
        // under whatever gate `execute` already holds. With BLOCK, the
        // immediate attempt takes the read guard itself and only a miss
        // releases it to park on the broadcast.
        let result = match block_ms.filter(|_| !in_exec) {
            None => self.state.store.xread(&keys, &cursors, count).await,
            Some(ms) => {
                let first = {
                    let gate = Arc::clone(&self.state.exec_gate);
                    let _guard = gate.read().await;
                    self.state.store.xread(&keys, &cursors, count).await
                };
                match first {
                    Ok(None) => {
                        let timeout =
                            Duration::from_millis(if ms == 0 { XREAD_BLOCK_UNIT_MS } else { ms });
                        self.state
                            .store
                            .xread_block(&keys, &cursors, count, timeout)
                            .await
                    }
                    other => other,
                }
            }
        };
        match result {
            Ok(Some(per_stream)) => xread_reply(&keys, &per_stream),
            Ok(None) => kv_wire::null_array(),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_info(&self, args: &[String]) -> Vec<u8> {
        let replication_section = args.first().is_some_and(|s| keyword_eq(s, "replication"));
        if !replication_section {
            return Vec::new();
        }
        let role = self.state.role().as_str();
        let replid = self.state.replication.replid().await;
        let offset = self.state.replication.offset().await;
        kv_wire::encode_bulk(&format!(
            "# Replication\nrole:{role}\nmaster_replid:{replid}\nmaster_repl_offset:{offset}\n"
        ))
    }

    async fn cmd_replconf(&self, args: &[String]) -> Vec<u8> {
        match args {
            [sub, target, ..] if keyword_eq(sub, "GETACK") && target == "*" => {
                let offset = self.state.replication.replica_offset().await.to_string();
                kv_wire::encode_bulk_array(&["REPLCONF", "ACK", offset.as_str()])
            }
            [sub, offset, ..] if keyword_eq(sub, "ACK") => {
                if let Ok(offset) = offset.parse::<u64>() {
                    self.state.replication.record_ack(offset).await;
                }
                Vec::new()
            }
            // listening-port / capa during the handshake.
            _ => kv_wire::encode_simple("OK"),
        }
    }

    /// `PSYNC ? -1`: full resync. The reply and the snapshot frame go out
    /// before the link joins the fan-out, so no propagated command can be
    /// queued ahead of the snapshot.
    async fn cmd_psync(&self) -> Vec<u8> {
        let replid = self.state.replication.replid().await;
        let mut reply = kv_wire::encode_simple(&format!("FULLRESYNC {replid} 0"));
        reply.extend_from_slice(&kv_wire::encode_rdb(kv_snapshot::EMPTY_SNAPSHOT));
        let _ = self.outbound.send(reply);
        self.state
            .replication
            .register_replica(self.conn_id, self.outbound.clone())
            .await;
        Vec::new()
    }

    async fn cmd_wait(&self, args: &[String], in_exec: bool) -> Vec<u8> {
        let [numreplicas, timeout_ms] = args else {
            return wrong_args("wait");
        };
        let (Ok(numreplicas), Ok(timeout_ms)) =
            (numreplicas.parse::<usize>(), timeout_ms.parse::<u64>())
        else {
            return store_err(&StoreError::NotAnInteger);
        };
        if numreplicas == 0 {
            return kv_wire::encode_int(0);
        }
        let replication = &self.state.replication;
        if in_exec {
            // Inside a transaction the barrier cannot park; answer with the
            // connected replica count, like a WAIT with nothing to wait for.
            return kv_wire::encode_int(replication.replica_count().await as i64);
        }
        if replication.offset().await == 0 {
            // Nothing has been propagated; every replica is trivially
            // caught up.
            return kv_wire::encode_int(replication.replica_count().await as i64);
        }

        replication.reset_acks().await;
        let getack_len = replication.send_getack().await;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let acks = loop {
            let acks = replication.acks().await;
            if acks >= numreplicas {
                break acks;
            }
            let now = Instant::now();
            if now >= deadline {
                break acks;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL.min(deadline - now)).await;
        };
        // The GETACK frame joins the offset only after the barrier, so the
        // acks above compared against the pre-GETACK offset they describe.
        replication.add_offset(getack_len).await;
        kv_wire::encode_int(acks as i64)
    }

    fn cmd_config(&self, args: &[String]) -> Vec<u8> {
        match args {
            [action, parameter] if keyword_eq(action, "GET") => {
                let config = &self.state.config;
                match parameter.as_str() {
                    "dir" => kv_wire::encode_bulk_array(&[
                        "dir".to_owned(),
                        config.dir.clone().unwrap_or_default(),
                    ]),
                    "dbfilename" => kv_wire::encode_bulk_array(&[
                        "dbfilename".to_owned(),
                        config.dbfilename.clone().unwrap_or_default(),
                    ]),
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    async fn cmd_subscribe(&mut self, args: &[String]) -> Vec<u8> {
        let [channel] = args else {
            return wrong_args("subscribe");
        };
        self.subscribed.insert(channel.clone());
        self.state
            .pubsub
            .subscribe(channel, self.conn_id, self.outbound.clone())
            .await;
        Frame::Array(vec![
            Frame::Bulk("subscribe".to_owned()),
            Frame::Bulk(channel.clone()),
            Frame::Integer(self.subscribed.len() as i64),
        ])
        .encode()
    }

    async fn cmd_unsubscribe(&mut self, args: &[String]) -> Vec<u8> {
        let [channel] = args else {
            return wrong_args("unsubscribe");
        };
        self.subscribed.remove(channel);
        self.state.pubsub.unsubscribe(channel, self.conn_id).await;
        Frame::Array(vec![
            Frame::Bulk("unsubscribe".to_owned()),
            Frame::Bulk(channel.clone()),
            Frame::Integer(self.subscribed.len() as i64),
        ])
        .encode()
    }

    async fn cmd_publish(&self, args: &[String]) -> Vec<u8> {
        let [channel, message] = args else {
            return wrong_args("publish");
        };
        let frame =
            kv_wire::encode_bulk_array(&["message", channel.as_str(), message.as_str()]);
        let delivered = self.state.pubsub.publish(channel, &frame).await;
        kv_wire::encode_int(delivered as i64)
    }

    async fn cmd_zadd(&self, args: &[String]) -> Vec<u8> {
        let [key, score, member] = args else {
            return wrong_args("zadd");
        };
        let Ok(score) = score.parse::<f64>() else {
            return store_err(&StoreError::NotAFloat);
        };
        if score.is_nan() {
            return store_err(&StoreError::NotAFloat);
        }
        match self.state.store.zadd(key, member, score).await {
            Ok(is_new) => kv_wire::encode_int(i64::from(is_new)),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_geoadd(&self, args: &[String]) -> Vec<u8> {
        let [key, longitude, latitude, member] = args else {
            return wrong_args("geoadd");
        };
        let (Ok(longitude), Ok(latitude)) = (longitude.parse::<f64>(), latitude.parse::<f64>())
        else {
            return store_err(&StoreError::NotAFloat);
        };
        match self.state.store.geoadd(key, member, longitude, latitude).await {
            Ok(is_new) => kv_wire::encode_int(i64::from(is_new)),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_geopos(&self, args: &[String]) -> Vec<u8> {
        let [key, member] = args else {
            return wrong_args("geopos");
        };
        match self.state.store.geopos(key, member).await {
            Ok(Some((longitude, latitude))) => Frame::Array(vec![Frame::Array(vec![
                Frame::Bulk(format!("{longitude:.17}")),
                Frame::Bulk(format!("{latitude:.17}")),
            ])])
            .encode(),
            Ok(None) => Frame::Array(vec![Frame::NullArray]).encode(),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_geodist(&self, args: &[String]) -> Vec<u8> {
        let [key, member1, member2] = args else {
            return wrong_args("geodist");
        };
        match self.state.store.geodist(key, member1, member2).await {
            Ok(Some(distance)) => kv_wire::encode_bulk(&format!("{distance:.4}")),
            Ok(None) => kv_wire::null_bulk(),
            Err(e) => store_err(&e),
        }
    }

    async fn cmd_geosearch(&self, args: &[String]) -> Vec<u8> {
        let [key, from_kw, longitude, latitude, by_kw, radius, unit] = args else {
            return syntax_err();
        };
        if !keyword_eq(from_kw, "FROMLONLAT") || !keyword_eq(by_kw, "BYRADIUS") {
            return syntax_err();
        }
        let (Ok(longitude), Ok(latitude), Ok(radius)) = (
            longitude.parse::<f64>(),
            latitude.parse::<f64>(),
            radius.parse::<f64>(),
        ) else {
            return store_err(&StoreError::NotAFloat);
        };
        let radius_m = if keyword_eq(unit, "m") {
            radius
        } else if keyword_eq(unit, "km") {
            radius * 1000.0
        } else {
            return kv_wire::encode_error("unsupported unit provided. please use m, km");
        };
        match self
            .state
            .store
            .geosearch_from_lonlat_by_radius(key, longitude, latitude, radius_m)
            .await
        {
            Ok(members) => kv_wire::encode_bulk_array(&members),
            Err(e) => store_err(&e),
        }
    }
}

/// `[id, [field, value, field, value, ...]]` per entry.
fn entries_frame(entries: &[StreamEntry]) -> Frame {
    Frame::Array(
        entries
            .iter()
            .map(|entry| {
                let mut flat = Vec::with_capacity(entry.fields.len() * 2);
                for (field, value) in &entry.fields {
                    flat.push(Frame::Bulk(field.clone()));
                    flat.push(Frame::Bulk(value.clone()));
                }
                Frame::Array(vec![
                    Frame::Bulk(entry.id.to_string()),
                    Frame::Array(flat),
                ])
            })
            .collect(),
    )
}

/// One `[key, entries]` pair per requested stream.
fn xread_reply(keys: &[String], per_stream: &[Vec<StreamEntry>]) -> Vec<u8> {
    Frame::Array(
        keys.iter()
            .zip(per_stream)
            .map(|(key, entries)| {
                Frame::Array(vec![Frame::Bulk(key.clone()), entries_frame(entries)])
            })
            .collect(),
    )
    .encode()
}

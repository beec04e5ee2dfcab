use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use podsim_protocol::DeckDescriptor;
use podsim_protocol::DeckRating;
use podsim_protocol::Job;
use podsim_protocol::JobPatch;
use podsim_protocol::JobStatus;
use podsim_protocol::MatchResult;
use podsim_protocol::SimState;
use podsim_protocol::Simulation;
use podsim_protocol::SimulationPatch;
use podsim_protocol::WorkerInfo;
use podsim_protocol::WorkerStatus;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

// ---- Firestore value constructors ----

pub(crate) fn str_value(value: impl Into<String>) -> Value {
    json!({ "stringValue": value.into() })
}

pub(crate) fn int_value(value: i64) -> Value {
    // integerValue is a string on the wire.
    json!({ "integerValue": value.to_string() })
}

pub(crate) fn double_value(value: f64) -> Value {
    json!({ "doubleValue": value })
}

pub(crate) fn bool_value(value: bool) -> Value {
    json!({ "booleanValue": value })
}

pub(crate) fn ts_value(value: DateTime<Utc>) -> Value {
    json!({ "timestampValue": value.to_rfc3339_opts(SecondsFormat::Millis, true) })
}

pub(crate) fn array_value(values: Vec<Value>) -> Value {
    json!({ "arrayValue": { "values": values } })
}

pub(crate) fn map_value(fields: Value) -> Value {
    json!({ "mapValue": { "fields": fields } })
}

pub(crate) fn str_array(items: &[String]) -> Value {
    array_value(items.iter().map(|item| str_value(item.clone())).collect())
}

/// Arbitrary JSON (the aggregate `results` artifact) encoded as Firestore
/// values, recursively.
pub(crate) fn json_to_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => bool_value(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                int_value(i)
            } else {
                double_value(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => str_value(s.clone()),
        Value::Array(items) => array_value(items.iter().map(json_to_value).collect()),
        Value::Object(map) => {
            let mut fields = Map::new();
            for (key, item) in map {
                fields.insert(key.clone(), json_to_value(item));
            }
            map_value(Value::Object(fields))
        }
    }
}

pub(crate) fn value_to_json(value: &Value) -> Value {
    if value.get("nullValue").is_some() {
        return Value::Null;
    }
    if let Some(b) = value.get("booleanValue").and_then(Value::as_bool) {
        return Value::Bool(b);
    }
    if let Some(s) = value.get("integerValue").and_then(Value::as_str) {
        return s.parse::<i64>().map_or(Value::Null, Value::from);
    }
    if let Some(d) = value.get("doubleValue").and_then(Value::as_f64) {
        return json!(d);
    }
    if let Some(s) = value.get("stringValue").and_then(Value::as_str) {
        return Value::String(s.to_string());
    }
    if let Some(s) = value.get("timestampValue").and_then(Value::as_str) {
        return Value::String(s.to_string());
    }
    if let Some(values) = value
        .get("arrayValue")
        .and_then(|array| array.get("values"))
        .and_then(Value::as_array)
    {
        return Value::Array(values.iter().map(value_to_json).collect());
    }
    if let Some(fields) = value
        .get("mapValue")
        .and_then(|map| map.get("fields"))
        .and_then(Value::as_object)
    {
        let mut out = Map::new();
        for (key, item) in fields {
            out.insert(key.clone(), value_to_json(item));
        }
        return Value::Object(out);
    }
    Value::Null
}

// ---- extractors ----

fn field<'a>(fields: &'a Value, name: &str) -> Option<&'a Value> {
    fields.get(name)
}

pub(crate) fn get_str(fields: &Value, name: &str) -> Option<String> {
    field(fields, name)?
        .get("stringValue")?
        .as_str()
        .map(str::to_string)
}

pub(crate) fn get_i64(fields: &Value, name: &str) -> Option<i64> {
    let value = field(fields, name)?;
    if let Some(s) = value.get("integerValue").and_then(Value::as_str) {
        return s.parse().ok();
    }
    value.get("integerValue").and_then(Value::as_i64)
}

pub(crate) fn get_f64(fields: &Value, name: &str) -> Option<f64> {
    let value = field(fields, name)?;
    value
        .get("doubleValue")
        .and_then(Value::as_f64)
        .or_else(|| get_i64(fields, name).map(|i| i as f64))
}

pub(crate) fn get_bool(fields: &Value, name: &str) -> Option<bool> {
    field(fields, name)?.get("booleanValue")?.as_bool()
}

pub(crate) fn get_ts(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    let raw = field(fields, name)?.get("timestampValue")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub(crate) fn get_values<'a>(fields: &'a Value, name: &str) -> Option<&'a Vec<Value>> {
    field(fields, name)?
        .get("arrayValue")?
        .get("values")?
        .as_array()
}

pub(crate) fn get_str_array(fields: &Value, name: &str) -> Vec<String> {
    get_values(fields, name)
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.get("stringValue").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn get_u32_array(fields: &Value, name: &str) -> Vec<u32> {
    get_values(fields, name)
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.get("integerValue").and_then(Value::as_str))
                .filter_map(|raw| raw.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn get_u64_array(fields: &Value, name: &str) -> Vec<u64> {
    get_values(fields, name)
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.get("integerValue").and_then(Value::as_str))
                .filter_map(|raw| raw.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

// ---- jobs ----

pub(crate) fn job_to_fields(job: &Job) -> Value {
    let mut fields = Map::new();
    fields.insert("id".into(), str_value(job.id.clone()));
    fields.insert("createdAt".into(), ts_value(job.created_at));
    fields.insert("createdBy".into(), str_value(job.created_by.clone()));
    fields.insert(
        "decks".into(),
        array_value(
            job.decks
                .iter()
                .map(|deck| {
                    map_value(json!({
                        "name": str_value(deck.name.clone()),
                        "content": str_value(deck.content.clone()),
                    }))
                })
                .collect(),
        ),
    );
    if let Some(deck_ids) = &job.deck_ids {
        fields.insert("deckIds".into(), str_array(deck_ids));
    }
    fields.insert("simulations".into(), int_value(i64::from(job.simulations)));
    fields.insert("parallelism".into(), int_value(i64::from(job.parallelism)));
    fields.insert("status".into(), str_value(job.status.as_str()));
    if let Some(key) = &job.idempotency_key {
        fields.insert("idempotencyKey".into(), str_value(key.clone()));
    }
    if let Some(started_at) = job.started_at {
        fields.insert("startedAt".into(), ts_value(started_at));
    }
    if let Some(completed_at) = job.completed_at {
        fields.insert("completedAt".into(), ts_value(completed_at));
    }
    if let Some(claimed_at) = job.claimed_at {
        fields.insert("claimedAt".into(), ts_value(claimed_at));
    }
    if let Some(worker_id) = &job.worker_id {
        fields.insert("workerId".into(), str_value(worker_id.clone()));
    }
    if let Some(worker_name) = &job.worker_name {
        fields.insert("workerName".into(), str_value(worker_name.clone()));
    }
    fields.insert("retryCount".into(), int_value(i64::from(job.retry_count)));
    fields.insert(
        "completedSimCount".into(),
        int_value(i64::from(job.completed_sim_count)),
    );
    fields.insert(
        "totalSimCount".into(),
        int_value(i64::from(job.total_sim_count)),
    );
    fields.insert(
        "needsAggregation".into(),
        bool_value(job.needs_aggregation),
    );
    fields.insert(
        "dockerRunDurationsMs".into(),
        array_value(
            job.docker_run_durations_ms
                .iter()
                .map(|ms| int_value(*ms as i64))
                .collect(),
        ),
    );
    if let Some(message) = &job.error_message {
        fields.insert("errorMessage".into(), str_value(message.clone()));
    }
    if let Some(results) = &job.results {
        fields.insert("results".into(), json_to_value(results));
    }
    Value::Object(fields)
}

pub(crate) fn fields_to_job(fields: &Value) -> Result<Job> {
    let status_raw = get_str(fields, "status").context("job missing status")?;
    let status =
        JobStatus::parse(&status_raw).with_context(|| format!("invalid job status {status_raw}"))?;
    let decks = get_values(fields, "decks")
        .map(|values| {
            values
                .iter()
                .filter_map(|value| {
                    let deck = value.get("mapValue")?.get("fields")?;
                    Some(DeckDescriptor {
                        name: get_str(deck, "name")?,
                        content: get_str(deck, "content").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let deck_ids = match get_values(fields, "deckIds") {
        Some(_) => Some(get_str_array(fields, "deckIds")),
        None => None,
    };
    Ok(Job {
        id: get_str(fields, "id").context("job missing id")?,
        created_at: get_ts(fields, "createdAt").context("job missing createdAt")?,
        created_by: get_str(fields, "createdBy").unwrap_or_default(),
        decks,
        deck_ids,
        simulations: u32::try_from(get_i64(fields, "simulations").unwrap_or(0))?,
        parallelism: u32::try_from(get_i64(fields, "parallelism").unwrap_or(1))?,
        status,
        idempotency_key: get_str(fields, "idempotencyKey"),
        started_at: get_ts(fields, "startedAt"),
        completed_at: get_ts(fields, "completedAt"),
        claimed_at: get_ts(fields, "claimedAt"),
        worker_id: get_str(fields, "workerId"),
        worker_name: get_str(fields, "workerName"),
        retry_count: u32::try_from(get_i64(fields, "retryCount").unwrap_or(0))?,
        completed_sim_count: u32::try_from(get_i64(fields, "completedSimCount").unwrap_or(0))?,
        total_sim_count: u32::try_from(get_i64(fields, "totalSimCount").unwrap_or(0))?,
        needs_aggregation: get_bool(fields, "needsAggregation").unwrap_or(false),
        docker_run_durations_ms: get_u64_array(fields, "dockerRunDurationsMs"),
        error_message: get_str(fields, "errorMessage"),
        results: field(fields, "results").map(value_to_json),
    })
}

pub(crate) fn job_patch_to_fields(target: JobStatus, patch: &JobPatch) -> (Value, Vec<String>) {
    let mut fields = Map::new();
    let mut mask = vec!["status".to_string()];
    fields.insert("status".into(), str_value(target.as_str()));
    if let Some(started_at) = patch.started_at {
        fields.insert("startedAt".into(), ts_value(started_at));
        mask.push("startedAt".into());
    }
    if let Some(completed_at) = patch.completed_at {
        fields.insert("completedAt".into(), ts_value(completed_at));
        mask.push("completedAt".into());
    }
    if let Some(claimed_at) = patch.claimed_at {
        fields.insert("claimedAt".into(), ts_value(claimed_at));
        mask.push("claimedAt".into());
    }
    if let Some(worker_id) = &patch.worker_id {
        fields.insert("workerId".into(), str_value(worker_id.clone()));
        mask.push("workerId".into());
    }
    if let Some(worker_name) = &patch.worker_name {
        fields.insert("workerName".into(), str_value(worker_name.clone()));
        mask.push("workerName".into());
    }
    if let Some(message) = &patch.error_message {
        fields.insert("errorMessage".into(), str_value(message.clone()));
        mask.push("errorMessage".into());
    }
    (Value::Object(fields), mask)
}

// ---- simulations ----

pub(crate) fn simulation_to_fields(sim: &Simulation) -> Value {
    let mut fields = Map::new();
    fields.insert("jobId".into(), str_value(sim.job_id.clone()));
    fields.insert("simId".into(), str_value(sim.sim_id.clone()));
    fields.insert("index".into(), int_value(i64::from(sim.index)));
    fields.insert("state".into(), str_value(sim.state.as_str()));
    if let Some(worker_id) = &sim.worker_id {
        fields.insert("workerId".into(), str_value(worker_id.clone()));
    }
    if let Some(worker_name) = &sim.worker_name {
        fields.insert("workerName".into(), str_value(worker_name.clone()));
    }
    if let Some(started_at) = sim.started_at {
        fields.insert("startedAt".into(), ts_value(started_at));
    }
    if let Some(completed_at) = sim.completed_at {
        fields.insert("completedAt".into(), ts_value(completed_at));
    }
    if let Some(duration_ms) = sim.duration_ms {
        fields.insert("durationMs".into(), int_value(duration_ms as i64));
    }
    if let Some(message) = &sim.error_message {
        fields.insert("errorMessage".into(), str_value(message.clone()));
    }
    fields.insert("winners".into(), str_array(&sim.winners));
    fields.insert(
        "winningTurns".into(),
        array_value(
            sim.winning_turns
                .iter()
                .map(|turn| int_value(i64::from(*turn)))
                .collect(),
        ),
    );
    Value::Object(fields)
}

pub(crate) fn fields_to_simulation(fields: &Value) -> Result<Simulation> {
    let state_raw = get_str(fields, "state").context("simulation missing state")?;
    let state = SimState::parse(&state_raw)
        .with_context(|| format!("invalid simulation state {state_raw}"))?;
    let winners = get_str_array(fields, "winners");
    let winning_turns = get_u32_array(fields, "winningTurns");
    Ok(Simulation {
        job_id: get_str(fields, "jobId").context("simulation missing jobId")?,
        sim_id: get_str(fields, "simId").context("simulation missing simId")?,
        index: u32::try_from(get_i64(fields, "index").unwrap_or(0))?,
        state,
        worker_id: get_str(fields, "workerId"),
        worker_name: get_str(fields, "workerName"),
        started_at: get_ts(fields, "startedAt"),
        completed_at: get_ts(fields, "completedAt"),
        duration_ms: get_i64(fields, "durationMs").map(u64::try_from).transpose()?,
        error_message: get_str(fields, "errorMessage"),
        winner: winners.first().cloned(),
        winning_turn: winning_turns.first().copied(),
        winners,
        winning_turns,
    })
}

pub(crate) fn simulation_patch_to_fields(patch: &SimulationPatch) -> (Value, Vec<String>) {
    let mut fields = Map::new();
    let mut mask = Vec::new();
    if let Some(state) = patch.state {
        fields.insert("state".into(), str_value(state.as_str()));
        mask.push("state".into());
    }
    if let Some(worker_id) = &patch.worker_id {
        fields.insert("workerId".into(), str_value(worker_id.clone()));
        mask.push("workerId".into());
    }
    if let Some(worker_name) = &patch.worker_name {
        fields.insert("workerName".into(), str_value(worker_name.clone()));
        mask.push("workerName".into());
    }
    if let Some(started_at) = patch.started_at {
        fields.insert("startedAt".into(), ts_value(started_at));
        mask.push("startedAt".into());
    }
    if let Some(completed_at) = patch.completed_at {
        fields.insert("completedAt".into(), ts_value(completed_at));
        mask.push("completedAt".into());
    }
    if let Some(duration_ms) = patch.duration_ms {
        fields.insert("durationMs".into(), int_value(duration_ms as i64));
        mask.push("durationMs".into());
    }
    if let Some(message) = &patch.error_message {
        fields.insert("errorMessage".into(), str_value(message.clone()));
        mask.push("errorMessage".into());
    }
    if let Some(winners) = &patch.winners {
        fields.insert("winners".into(), str_array(winners));
        mask.push("winners".into());
    }
    if let Some(winning_turns) = &patch.winning_turns {
        fields.insert(
            "winningTurns".into(),
            array_value(
                winning_turns
                    .iter()
                    .map(|turn| int_value(i64::from(*turn)))
                    .collect(),
            ),
        );
        mask.push("winningTurns".into());
    }
    (Value::Object(fields), mask)
}

// ---- workers ----

pub(crate) fn worker_to_fields(info: &WorkerInfo) -> (Value, Vec<String>) {
    let mut fields = Map::new();
    let mut mask = Vec::new();
    let mut put = |name: &str, value: Value, mask: &mut Vec<String>| {
        fields.insert(name.to_string(), value);
        mask.push(name.to_string());
    };
    put("workerId", str_value(info.worker_id.clone()), &mut mask);
    put("workerName", str_value(info.worker_name.clone()), &mut mask);
    put("status", str_value(info.status.as_str()), &mut mask);
    if let Some(job_id) = &info.current_job_id {
        put("currentJobId", str_value(job_id.clone()), &mut mask);
    } else {
        put("currentJobId", json!({ "nullValue": null }), &mut mask);
    }
    put("capacity", int_value(i64::from(info.capacity)), &mut mask);
    put(
        "activeSimulations",
        int_value(i64::from(info.active_simulations)),
        &mut mask,
    );
    put("uptimeMs", int_value(info.uptime_ms as i64), &mut mask);
    put("lastHeartbeat", ts_value(info.last_heartbeat), &mut mask);
    // Operator-owned fields are only written when present so a merge
    // update leaves them alone.
    if let Some(version) = &info.version {
        put("version", str_value(version.clone()), &mut mask);
    }
    if let Some(limit) = info.max_concurrent_override {
        put("maxConcurrentOverride", int_value(i64::from(limit)), &mut mask);
    }
    if let Some(email) = &info.owner_email {
        put("ownerEmail", str_value(email.clone()), &mut mask);
    }
    (Value::Object(fields), mask)
}

pub(crate) fn fields_to_worker(fields: &Value) -> Result<WorkerInfo> {
    let status_raw = get_str(fields, "status").context("worker missing status")?;
    let status = WorkerStatus::parse(&status_raw)
        .with_context(|| format!("invalid worker status {status_raw}"))?;
    Ok(WorkerInfo {
        worker_id: get_str(fields, "workerId").context("worker missing workerId")?,
        worker_name: get_str(fields, "workerName").unwrap_or_default(),
        status,
        current_job_id: get_str(fields, "currentJobId"),
        capacity: u32::try_from(get_i64(fields, "capacity").unwrap_or(0))?,
        active_simulations: u32::try_from(get_i64(fields, "activeSimulations").unwrap_or(0))?,
        uptime_ms: u64::try_from(get_i64(fields, "uptimeMs").unwrap_or(0))?,
        last_heartbeat: get_ts(fields, "lastHeartbeat").context("worker missing lastHeartbeat")?,
        version: get_str(fields, "version"),
        max_concurrent_override: get_i64(fields, "maxConcurrentOverride")
            .map(u32::try_from)
            .transpose()?,
        owner_email: get_str(fields, "ownerEmail"),
    })
}

// ---- ratings & match results ----

pub(crate) fn rating_to_fields(rating: &DeckRating) -> Value {
    json!({
        "deckId": str_value(rating.deck_id.clone()),
        "mu": double_value(rating.mu),
        "sigma": double_value(rating.sigma),
        "gamesPlayed": int_value(i64::from(rating.games_played)),
        "wins": int_value(i64::from(rating.wins)),
        "lastUpdated": ts_value(rating.last_updated),
    })
}

pub(crate) fn fields_to_rating(fields: &Value) -> Result<DeckRating> {
    Ok(DeckRating {
        deck_id: get_str(fields, "deckId").context("rating missing deckId")?,
        mu: get_f64(fields, "mu").context("rating missing mu")?,
        sigma: get_f64(fields, "sigma").context("rating missing sigma")?,
        games_played: u32::try_from(get_i64(fields, "gamesPlayed").unwrap_or(0))?,
        wins: u32::try_from(get_i64(fields, "wins").unwrap_or(0))?,
        last_updated: get_ts(fields, "lastUpdated").context("rating missing lastUpdated")?,
    })
}

pub(crate) fn match_result_to_fields(result: &MatchResult) -> Value {
    let mut fields = Map::new();
    fields.insert("id".into(), str_value(result.id.clone()));
    fields.insert("jobId".into(), str_value(result.job_id.clone()));
    fields.insert("gameIndex".into(), int_value(i64::from(result.game_index)));
    fields.insert("deckIds".into(), str_array(&result.deck_ids));
    if let Some(winner) = &result.winner_deck_id {
        fields.insert("winnerDeckId".into(), str_value(winner.clone()));
    }
    if let Some(turns) = result.turn_count {
        fields.insert("turnCount".into(), int_value(i64::from(turns)));
    }
    fields.insert("playedAt".into(), ts_value(result.played_at));
    Value::Object(fields)
}

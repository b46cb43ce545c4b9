//! Redis-backed job store.
//!
//! ## Layout
//!
//! - **Job hash**: `{prefix}:jobs:{id}`, one hash field per job field. Integers
//!   are stored as decimal text, `data` as raw bytes; a null field is absent.
//! - **Pending index**: sorted set `{prefix}:jobs:pending`. Score is the negated
//!   priority, member is the scheduled time zero-padded to 20 digits, `:`,
//!   then the id. Equal scores sort by member bytes, which gives time then id
//!   ascending.
//! - **Status sets**: `{prefix}:jobs:status:{status}` hold the ids per status
//!   for listing and counting.
//!
//! Every mutation that touches both a hash and the index runs as one Lua
//! script, which Redis executes atomically.
//!
//! Scores are doubles, so priorities beyond ±2^53 lose precision in the
//! ranking (the stored priority itself stays exact).

use std::collections::HashMap;
use std::sync::Arc;

use redis::{Connection, Script};
use tracing::instrument;

use jobforge_core::{JobId, JobStatus, StoreError};

use super::job::{FieldUpdate, FieldValue, Job, JobField};
use super::store::{Expect, JobStats, JobStore, validate_field_write, validate_transition};

/// Default key prefix
const DEFAULT_PREFIX: &str = "jobforge";

/// Shared by every script: KEYS[1] is the job hash, ARGV[1] the job id.
const LUA_HELPERS: &str = r#"
local function index_member()
  local t = redis.call('HGET', KEYS[1], 'time')
  return string.rep('0', 20 - #t) .. t .. ':' .. ARGV[1]
end
local function index_score()
  local p = redis.call('HGET', KEYS[1], 'priority')
  if string.sub(p, 1, 1) == '-' then return string.sub(p, 2) end
  return '-' .. p
end
"#;

/// KEYS: job, pending, status set. ARGV: id, field/value pairs.
const CREATE_JOB: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('SADD', KEYS[3], ARGV[1])
if redis.call('HGET', KEYS[1], 'status') == 'queued' then
  redis.call('ZADD', KEYS[2], index_score(), index_member())
end
return 1
"#;

/// KEYS: job, pending, old status set, new status set.
/// ARGV: id, expected status, expected claim ('' = any), new status,
/// then (field, 'set'|'del', value) triples.
const COMPARE_AND_SET: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
local claim = redis.call('HGET', KEYS[1], 'claim')
if status ~= ARGV[2] or (ARGV[3] ~= '' and claim ~= ARGV[3]) then
  return {'conflict', status}
end
if status == 'queued' then redis.call('ZREM', KEYS[2], index_member()) end
for i = 5, #ARGV, 3 do
  if ARGV[i + 1] == 'del' then
    redis.call('HDEL', KEYS[1], ARGV[i])
  else
    redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 2])
  end
end
redis.call('HSET', KEYS[1], 'status', ARGV[4])
redis.call('SMOVE', KEYS[3], KEYS[4], ARGV[1])
if ARGV[4] == 'queued' then
  redis.call('ZADD', KEYS[2], index_score(), index_member())
end
local out = {'ok'}
for _, v in ipairs(redis.call('HGETALL', KEYS[1])) do out[#out + 1] = v end
return out
"#;

/// KEYS: job, pending. ARGV: id, field, 'set'|'del', value, expected status
/// ('' = any). Only an existing index entry is re-ranked.
const SET_FIELD: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
if ARGV[5] ~= '' and status ~= ARGV[5] then return {'conflict', status} end
local indexed = status == 'queued' and redis.call('ZREM', KEYS[2], index_member()) == 1
if ARGV[3] == 'del' then
  redis.call('HDEL', KEYS[1], ARGV[2])
else
  redis.call('HSET', KEYS[1], ARGV[2], ARGV[4])
end
if indexed then redis.call('ZADD', KEYS[2], index_score(), index_member()) end
local out = {'ok'}
if ARGV[5] ~= '' then
  for _, v in ipairs(redis.call('HGETALL', KEYS[1])) do out[#out + 1] = v end
end
return out
"#;

/// KEYS: pending. ARGV: zero-padded now, limit.
const QUERY_ELIGIBLE: &str = r#"
local limit = tonumber(ARGV[2])
local out = {}
local start = 0
local chunk = 256
while #out < limit do
  local members = redis.call('ZRANGE', KEYS[1], start, start + chunk - 1)
  if #members == 0 then break end
  for _, m in ipairs(members) do
    if string.sub(m, 1, 20) <= ARGV[1] then
      out[#out + 1] = string.sub(m, 22)
      if #out >= limit then break end
    end
  end
  start = start + chunk
end
return out
"#;

/// KEYS: job, pending. ARGV: id.
const DELETE_FROM_INDEX: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('ZREM', KEYS[2], index_member())
  return 1
end
local cursor = '0'
repeat
  local page = redis.call('ZSCAN', KEYS[2], cursor, 'MATCH', '*:' .. ARGV[1])
  cursor = page[1]
  for i = 1, #page[2], 2 do redis.call('ZREM', KEYS[2], page[2][i]) end
until cursor == '0'
return 1
"#;

/// KEYS: job, pending, every status set. ARGV: id, refused status ('' = none).
const DELETE_JOB: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'missing'} end
local status = redis.call('HGET', KEYS[1], 'status')
if status == ARGV[2] then return {'conflict', status} end
if status == 'queued' then
  redis.call('ZREM', KEYS[2], index_member())
end
for i = 3, #KEYS do redis.call('SREM', KEYS[i], ARGV[1]) end
redis.call('DEL', KEYS[1])
return {'ok'}
"#;

#[derive(Debug)]
struct Scripts {
    create: Script,
    compare_and_set: Script,
    set_field: Script,
    query_eligible: Script,
    delete_from_index: Script,
    delete_job: Script,
}

impl Scripts {
    fn load() -> Self {
        let with_helpers = |body: &str| Script::new(&format!("{LUA_HELPERS}{body}"));
        Self {
            create: with_helpers(CREATE_JOB),
            compare_and_set: with_helpers(COMPARE_AND_SET),
            set_field: with_helpers(SET_FIELD),
            query_eligible: Script::new(QUERY_ELIGIBLE),
            delete_from_index: with_helpers(DELETE_FROM_INDEX),
            delete_job: with_helpers(DELETE_JOB),
        }
    }
}

/// Redis job store.
#[derive(Debug, Clone)]
pub struct RedisJobStore {
    client: Arc<redis::Client>,
    prefix: String,
    scripts: Arc<Scripts>,
}

impl RedisJobStore {
    /// Create a store.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `prefix` - key prefix (default: "jobforge")
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StoreError::backend(format!("redis connection error: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            scripts: Arc::new(Scripts::load()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        self.client
            .get_connection()
            .map_err(|e| StoreError::backend(format!("redis connection error: {e}")))
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:jobs:{id}", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:jobs:pending", self.prefix)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}:jobs:status:{}", self.prefix, status.as_str())
    }

    fn write_field(
        &self,
        id: JobId,
        field: JobField,
        value: &FieldValue,
        expected: Option<JobStatus>,
    ) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        validate_field_write(field, value)?;

        let mut conn = self.connection()?;
        let mut invocation = self.scripts.set_field.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.pending_key())
            .arg(id.to_string())
            .arg(field.as_str());
        match encode_value(value) {
            Some(bytes) => invocation.arg("set").arg(bytes),
            None => invocation.arg("del").arg(""),
        };
        invocation.arg(expected.map(|s| s.as_str()).unwrap_or_default());
        let reply: Vec<Vec<u8>> = invocation.invoke(&mut conn).map_err(command_error)?;
        guarded_reply(id, reply)
    }

    fn remove(&self, id: JobId, refused: Option<JobStatus>) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let mut invocation = self.scripts.delete_job.prepare_invoke();
        invocation.key(self.job_key(id)).key(self.pending_key());
        for status in JobStatus::ALL {
            invocation.key(self.status_key(status));
        }
        invocation
            .arg(id.to_string())
            .arg(refused.map(|s| s.as_str()).unwrap_or_default());
        let reply: Vec<Vec<u8>> = invocation.invoke(&mut conn).map_err(command_error)?;
        guarded_reply(id, reply).map(|_| ())
    }
}

impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let mut invocation = self.scripts.create.prepare_invoke();
        invocation
            .key(self.job_key(job.id))
            .key(self.pending_key())
            .key(self.status_key(job.status))
            .arg(job.id.to_string());
        for field in JobField::ALL {
            if let Some(bytes) = encode_value(&job.get(field)) {
                invocation.arg(field.as_str()).arg(bytes);
            }
        }
        let created: i64 = invocation.invoke(&mut conn).map_err(command_error)?;
        if created == 0 {
            return Err(StoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Result<Job, StoreError> {
        let mut conn = self.connection()?;
        let hash: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(self.job_key(id))
            .query(&mut conn)
            .map_err(command_error)?;
        if hash.is_empty() {
            return Err(StoreError::NotFound(id));
        }
        decode_hash(id, hash)
    }

    #[instrument(skip(self, value), fields(field = field.as_str()), err)]
    fn set_field(&self, id: JobId, field: JobField, value: FieldValue) -> Result<(), StoreError> {
        self.write_field(id, field, &value, None).map(|_| ())
    }

    #[instrument(skip(self, value), fields(field = field.as_str(), expected = %status), err)]
    fn set_field_if(
        &self,
        id: JobId,
        status: JobStatus,
        field: JobField,
        value: FieldValue,
    ) -> Result<Job, StoreError> {
        let hash = self.write_field(id, field, &value, Some(status))?;
        decode_hash(id, hash)
    }

    #[instrument(skip(self, updates), fields(expected = %expect.status, new = %new), err)]
    fn compare_and_set_status(
        &self,
        id: JobId,
        expect: Expect,
        new: JobStatus,
        updates: &[FieldUpdate],
    ) -> Result<Job, StoreError> {
        validate_transition(&expect, new, updates)?;

        let mut conn = self.connection()?;
        let mut invocation = self.scripts.compare_and_set.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.pending_key())
            .key(self.status_key(expect.status))
            .key(self.status_key(new))
            .arg(id.to_string())
            .arg(expect.status.as_str())
            .arg(expect.claim.map(|c| c.to_string()).unwrap_or_default())
            .arg(new.as_str());
        for update in updates {
            invocation.arg(update.field.as_str());
            match encode_value(&update.value) {
                Some(bytes) => invocation.arg("set").arg(bytes),
                None => invocation.arg("del").arg(""),
            };
        }

        let reply: Vec<Vec<u8>> = invocation.invoke(&mut conn).map_err(command_error)?;
        decode_hash(id, guarded_reply(id, reply)?)
    }

    fn query_eligible(&self, now: i64, limit: usize) -> Result<Vec<JobId>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection()?;
        let ids: Vec<String> = self
            .scripts
            .query_eligible
            .key(self.pending_key())
            .arg(format!("{:020}", now.max(0)))
            .arg(limit.min(i64::MAX as usize) as i64)
            .invoke(&mut conn)
            .map_err(command_error)?;
        ids.iter()
            .map(|id| {
                id.parse::<JobId>()
                    .map_err(|e| StoreError::corrupt(format!("{e}")))
            })
            .collect()
    }

    fn delete_from_index(&self, id: JobId) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: i64 = self
            .scripts
            .delete_from_index
            .key(self.job_key(id))
            .key(self.pending_key())
            .arg(id.to_string())
            .invoke(&mut conn)
            .map_err(command_error)?;
        Ok(())
    }

    fn delete_job(&self, id: JobId) -> Result<(), StoreError> {
        self.remove(id, None)
    }

    fn delete_job_unless(&self, id: JobId, refused: JobStatus) -> Result<(), StoreError> {
        self.remove(id, Some(refused))
    }

    fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, StoreError> {
        let ids: Vec<String> = {
            let mut conn = self.connection()?;
            redis::cmd("SMEMBERS")
                .arg(self.status_key(status))
                .query(&mut conn)
                .map_err(command_error)?
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id
                .parse::<JobId>()
                .map_err(|e| StoreError::corrupt(format!("{e}")))?;
            match self.get_job(id) {
                Ok(job) if job.status == status => jobs.push(job),
                // Moved or deleted since SMEMBERS.
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        jobs.sort_by_key(|job| (job.time, job.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let mut conn = self.connection()?;
        let mut pipe = redis::pipe();
        for status in JobStatus::ALL {
            pipe.cmd("SCARD").arg(self.status_key(status));
        }
        let counts: Vec<usize> = pipe.query(&mut conn).map_err(command_error)?;

        let mut stats = JobStats::default();
        for (status, count) in JobStatus::ALL.into_iter().zip(counts) {
            stats.record(status, count);
        }
        Ok(stats)
    }
}

/// Decode a guarded script reply: `ok` followed by the job hash as flat
/// field/value pairs (possibly none), `conflict` followed by the actual
/// status, or `missing`.
fn guarded_reply(id: JobId, reply: Vec<Vec<u8>>) -> Result<HashMap<String, Vec<u8>>, StoreError> {
    let (head, rest) = reply
        .split_first()
        .ok_or_else(|| StoreError::backend("empty script reply"))?;
    match head.as_slice() {
        b"ok" => rest
            .chunks_exact(2)
            .map(|pair| Ok((utf8(&pair[0])?, pair[1].clone())))
            .collect(),
        b"conflict" => {
            let actual = rest
                .first()
                .map(|raw| utf8(raw))
                .transpose()?
                .unwrap_or_default()
                .parse::<JobStatus>()
                .map_err(|e| StoreError::corrupt(format!("{e}")))?;
            Err(StoreError::Conflict { id, actual })
        }
        b"missing" => Err(StoreError::NotFound(id)),
        other => Err(StoreError::backend(format!(
            "unexpected script reply: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn command_error(err: redis::RedisError) -> StoreError {
    StoreError::backend(format!("redis command error: {err}"))
}

fn utf8(raw: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(raw.to_vec()).map_err(|e| StoreError::corrupt(format!("non-utf8 field: {e}")))
}

/// Hash representation of a field value; `None` means the field is absent.
fn encode_value(value: &FieldValue) -> Option<Vec<u8>> {
    match value {
        FieldValue::Null => None,
        FieldValue::Int(n) => Some(n.to_string().into_bytes()),
        FieldValue::Text(s) => Some(s.clone().into_bytes()),
        FieldValue::Bytes(b) => Some(b.clone()),
    }
}

fn decode_hash(id: JobId, hash: HashMap<String, Vec<u8>>) -> Result<Job, StoreError> {
    let mut fields = Vec::with_capacity(JobField::ALL.len());
    for field in JobField::ALL {
        let value = match (field, hash.get(field.as_str())) {
            (_, None) => continue,
            (JobField::Data, Some(raw)) => FieldValue::Bytes(raw.clone()),
            (
                JobField::Priority
                | JobField::Time
                | JobField::Freq
                | JobField::RetriesLeft
                | JobField::Started
                | JobField::Finished,
                Some(raw),
            ) => {
                let text = utf8(raw)?;
                FieldValue::Int(text.parse::<i64>().map_err(|_| {
                    StoreError::corrupt(format!("{} is not an integer: {text}", field.as_str()))
                })?)
            }
            (_, Some(raw)) => FieldValue::Text(utf8(raw)?),
        };
        fields.push((field, value));
    }
    Job::from_fields(id, fields)
}

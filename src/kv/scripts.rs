//! Redis Lua scripts for atomic admission and spend operations.
//!
//! Each script consolidates multiple Redis operations into a single atomic
//! unit, eliminating check-then-act races and reducing round-trips. The
//! in-memory backend mirrors these semantics exactly; keep both in sync.

/// Sliding-window admit with idempotent members.
///
/// KEYS: [1] window zset
/// ARGV: [1] now, [2] window_seconds, [3] limit, [4] member, [5] expire_seconds
///
/// Returns `{allowed, count, oldest_score}`.
pub const SLIDING_WINDOW: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local expire = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, 0, now - window)

-- Idempotency: a known member refreshes its timestamp without consuming a
-- second slot (double-click / retry guarantee).
local existing = redis.call('ZSCORE', key, member)
if existing then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, expire)
    return {1, redis.call('ZCARD', key), 0}
end

local count = redis.call('ZCARD', key)
if count >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local oldest_score = 0
    if oldest[2] then
        oldest_score = tonumber(oldest[2])
    end
    return {0, count, oldest_score}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, expire)
return {1, count + 1, 0}
"#;

/// Check both spend limits and reserve the buffered cost when allowed.
///
/// KEYS: [1] daily cost counter, [2] hourly cost counter
/// ARGV: [1] buffered_cost, [2] daily_limit, [3] hourly_limit,
///       [4] daily_ttl, [5] hourly_ttl
///
/// Returns `{status, daily_total, hourly_total}` with totals as strings
/// (floats do not survive Lua->Redis integer conversion). Status 0 means
/// reserved; 1/2 mean the daily/hourly limit would be exceeded and nothing
/// was incremented.
pub const CHECK_AND_RESERVE_SPEND: &str = r#"
local cost = tonumber(ARGV[1])
local daily_limit = tonumber(ARGV[2])
local hourly_limit = tonumber(ARGV[3])

local daily = tonumber(redis.call('GET', KEYS[1]) or '0')
local hourly = tonumber(redis.call('GET', KEYS[2]) or '0')

if daily + cost >= daily_limit then
    return {1, tostring(daily), tostring(hourly)}
end
if hourly + cost >= hourly_limit then
    return {2, tostring(daily), tostring(hourly)}
end

local new_daily = redis.call('INCRBYFLOAT', KEYS[1], cost)
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[4]))
local new_hourly = redis.call('INCRBYFLOAT', KEYS[2], cost)
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[5]))
return {0, tostring(new_daily), tostring(new_hourly)}
"#;

/// Apply a signed cost adjustment and record token counts.
///
/// KEYS: [1] daily cost, [2] hourly cost, [3] daily token hash, [4] hourly token hash
/// ARGV: [1] cost_delta, [2] input_tokens, [3] output_tokens,
///       [4] daily_ttl, [5] hourly_ttl
pub const ADJUST_SPEND: &str = r#"
local delta = tonumber(ARGV[1])
local input = tonumber(ARGV[2])
local output = tonumber(ARGV[3])
local daily_ttl = tonumber(ARGV[4])
local hourly_ttl = tonumber(ARGV[5])

if delta ~= 0 then
    redis.call('INCRBYFLOAT', KEYS[1], delta)
    redis.call('INCRBYFLOAT', KEYS[2], delta)
end
redis.call('EXPIRE', KEYS[1], daily_ttl)
redis.call('EXPIRE', KEYS[2], hourly_ttl)

if input > 0 then
    redis.call('HINCRBY', KEYS[3], 'input', input)
    redis.call('HINCRBY', KEYS[4], 'input', input)
end
if output > 0 then
    redis.call('HINCRBY', KEYS[3], 'output', output)
    redis.call('HINCRBY', KEYS[4], 'output', output)
end
redis.call('EXPIRE', KEYS[3], daily_ttl)
redis.call('EXPIRE', KEYS[4], hourly_ttl)
return 0
"#;

/// Cost-based throttling over a burst window and a dated daily set.
///
/// KEYS: [1] window zset, [2] daily zset, [3] throttle marker
/// ARGV: [1] now, [2] window_seconds, [3] estimated_cost, [4] window_threshold,
///       [5] daily_limit, [6] throttle_duration, [7] member, [8] daily_ttl
///
/// Member format: `<fingerprint>:<cost>`; the cost is the substring after
/// the LAST colon so IPv6-style members parse correctly.
///
/// Returns `{0,0}` allowed, `{1,ttl}` already throttled, `{2,2*dur}` daily
/// limit, `{3,dur}` window burst.
pub const COST_THROTTLE: &str = r#"
local function extract_cost(member_str)
    local last_colon_pos = 0
    local pos = 1
    while true do
        local colon_pos = string.find(member_str, ':', pos, true)
        if colon_pos then
            last_colon_pos = colon_pos
            pos = colon_pos + 1
        else
            break
        end
    end
    if last_colon_pos > 0 then
        return tonumber(string.sub(member_str, last_colon_pos + 1))
    end
    return tonumber(member_str)
end

local window_key = KEYS[1]
local daily_key = KEYS[2]
local marker_key = KEYS[3]

local now = tonumber(ARGV[1])
local window_seconds = tonumber(ARGV[2])
local estimated_cost = tonumber(ARGV[3])
local threshold = tonumber(ARGV[4])
local daily_limit = tonumber(ARGV[5])
local throttle_duration = tonumber(ARGV[6])
local member = ARGV[7]
local daily_ttl = tonumber(ARGV[8])

local marker_ttl = redis.call('TTL', marker_key)
if marker_ttl > 0 then
    return {1, marker_ttl}
elseif marker_ttl == -1 then
    -- Marker without expiry should not exist; drop it and continue.
    redis.call('DEL', marker_key)
end

redis.call('ZREMRANGEBYSCORE', window_key, 0, now - window_seconds)

local window_total = 0.0
local window_members = redis.call('ZRANGE', window_key, 0, -1)
for i = 1, #window_members do
    local cost = extract_cost(tostring(window_members[i]))
    if cost and cost > 0 then
        window_total = window_total + cost
    end
end

local daily_total = 0.0
local daily_members = redis.call('ZRANGE', daily_key, 0, -1)
for i = 1, #daily_members do
    local cost = extract_cost(tostring(daily_members[i]))
    if cost and cost > 0 then
        daily_total = daily_total + cost
    end
end

if daily_total + estimated_cost >= daily_limit then
    redis.call('SETEX', marker_key, throttle_duration * 2, now)
    return {2, throttle_duration * 2}
end

if window_total + estimated_cost >= threshold then
    redis.call('SETEX', marker_key, throttle_duration, now)
    return {3, throttle_duration}
end

redis.call('ZADD', window_key, now, member)
redis.call('EXPIRE', window_key, window_seconds + 60)
redis.call('ZADD', daily_key, now, member)
redis.call('EXPIRE', daily_key, daily_ttl)
return {0, 0}
"#;

/// Atomic challenge mint with smart reuse and a progressive ban ladder.
///
/// KEYS: [1] active zset, [2] rate-limit marker, [3] ban key,
///       [4] violations counter, [5] challenge value key (for the candidate)
/// ARGV: [1] identifier, [2] candidate_id, [3] now, [4] ttl_seconds,
///       [5] max_active, [6] rate_limit_seconds
///
/// Returns a tagged array: `{'minted', id, ttl}`, `{'reused', id, remaining}`,
/// `{'ratelimited', retry_after}`, `{'toomany', retry, expiry, count}` or
/// `{'banned', retry, expiry, count}`.
pub const CHALLENGE_MINT: &str = r#"
local active_key = KEYS[1]
local rate_key = KEYS[2]
local ban_key = KEYS[3]
local vio_key = KEYS[4]
local chal_key = KEYS[5]

local identifier = ARGV[1]
local candidate = ARGV[2]
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local max_active = tonumber(ARGV[5])
local rate_secs = tonumber(ARGV[6])

-- Scores are expiry timestamps; anything <= now is dead.
redis.call('ZREMRANGEBYSCORE', active_key, 0, now)

local ban = redis.call('GET', ban_key)
if ban then
    local expiry = tonumber(ban)
    if expiry and expiry > now then
        local count = tonumber(redis.call('GET', vio_key) or '1')
        return {'banned', expiry - now, expiry, count}
    end
    redis.call('DEL', ban_key)
end

local last = redis.call('GET', rate_key)
if last then
    local since = now - tonumber(last)
    if since < rate_secs then
        -- Smart reuse: hand back a challenge minted moments ago (page-load
        -- bursts) instead of erroring.
        local recent = redis.call('ZRANGE', active_key, -1, -1, 'WITHSCORES')
        if recent[1] then
            local expiry = tonumber(recent[2])
            local created = expiry - ttl
            if (now - created) < (rate_secs + 2) then
                return {'reused', recent[1], expiry - now}
            end
        end
        return {'ratelimited', rate_secs - since}
    end
end
redis.call('SETEX', rate_key, rate_secs + 1, now)

local active = redis.call('ZCARD', active_key)
if active >= max_active then
    local count = redis.call('INCR', vio_key)
    redis.call('EXPIRE', vio_key, 3600)
    local dur = 60
    if count >= 2 then
        dur = 300
    end
    local expiry = now + dur
    redis.call('SETEX', ban_key, dur, expiry)
    return {'toomany', dur, expiry, count}
end

-- Clean mint with no active ban clears the violation history.
if redis.call('GET', vio_key) then
    redis.call('DEL', vio_key)
end

redis.call('SETEX', chal_key, ttl, identifier)
redis.call('ZADD', active_key, now + ttl, candidate)
redis.call('EXPIRE', active_key, ttl + 60)
return {'minted', candidate, ttl}
"#;

/// Atomic single-use challenge consumption.
///
/// KEYS: [1] challenge value key, [2] active zset
/// ARGV: [1] expected identifier, [2] challenge_id
pub const CHALLENGE_CONSUME: &str = r#"
local stored = redis.call('GET', KEYS[1])
if not stored then
    return 'notfound'
end
if stored ~= ARGV[1] then
    return 'mismatch'
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[2])
return 'consumed'
"#;

/// Read a ban marker, deleting it when expired.
///
/// KEYS: [1] ban key; ARGV: [1] now. Returns the expiry or 0.
pub const CHECK_BAN: &str = r#"
local value = redis.call('GET', KEYS[1])
if not value then
    return 0
end
local expiry = tonumber(value)
if expiry and expiry > tonumber(ARGV[1]) then
    return expiry
end
redis.call('DEL', KEYS[1])
return 0
"#;

/// Record a violation and apply the progressive ban ladder.
///
/// KEYS: [1] violations counter, [2] ban key
/// ARGV: [1] now, [2] violation_ttl, [3..] ladder durations in seconds
///
/// Returns `{violation_count, ban_expiry}`.
pub const REGISTER_VIOLATION: &str = r#"
local count = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))

local ladder_len = #ARGV - 2
local idx = count
if idx > ladder_len then
    idx = ladder_len
end
local duration = tonumber(ARGV[idx + 2])
local expiry = tonumber(ARGV[1]) + duration
redis.call('SETEX', KEYS[2], duration, expiry)
return {count, expiry}
"#;

//! 消息分片编解码。
//!
//! KVP 单个值的长度有限（保守取 1000 字符），因此任意长度的消息都会被切分为若干分片，
//! 以独立的键写入存储：
//! - 分片名：`<通信ID><分隔符><序号><分隔符><总数>`，例如 `DevSetup{7}~2~3`
//! - 进度消息名：`<通信ID>_Progress_<序列号>`，它本身也是一个逻辑 ID，写入时同样会被分片
//! - 通信 ID：`<前缀>{<计数器>}`，例如 `DevSetup{7}`
//!
//! 存储不保证顺序、可能残留旧数据、可能出现重复写入，因此合并（[`MessageCodec::merge`]）
//! 只输出分片齐全的消息；格式错误或不完整的分片一律静默跳过。
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeMap;

use tracing::debug;

/// 默认消息名前缀。
pub const DEFAULT_PREFIX: &str = "DevSetup";

/// 默认分片分隔符。
pub const DEFAULT_SEPARATOR: char = '~';

/// 单个分片允许的最大字符数。
///
/// 平台文档未给出明确上限，Linux 集成服务中的 `HV_KVP_EXCHANGE_MAX_KEY_SIZE` 为 2048 字节，
/// 按 UTF-16 计算即约 1000 字符。
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1000;

/// 进度消息名中的固定标记。
pub const PROGRESS_MARKER: &str = "_Progress_";

/// 解析后的分片名。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkName<'a> {
    /// 分片所属的逻辑 ID（通信 ID 或进度消息名）。
    pub logical_id: &'a str,
    /// 分片序号，从 1 开始。
    pub index: u32,
    /// 该消息的分片总数。
    pub total: u32,
}

/// 分片编解码器：持有前缀、分隔符与分片长度上限。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCodec {
    prefix: String,
    separator: char,
    max_chunk_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, DEFAULT_SEPARATOR, DEFAULT_MAX_CHUNK_SIZE)
    }
}

impl MessageCodec {
    /// 创建编解码器。`max_chunk_size` 为 0 时按 1 处理。
    pub fn new(prefix: impl Into<String>, separator: char, max_chunk_size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            separator,
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// 所有协议消息名共同的起始部分（`<前缀>{`），用于在存储中筛选。
    pub fn message_id_start(&self) -> String {
        format!("{}{{", self.prefix)
    }

    /// 由计数器生成通信 ID：`<前缀>{<计数器>}`。
    pub fn communication_id(&self, counter: u32) -> String {
        format!("{}{{{}}}", self.prefix, counter)
    }

    /// 从通信 ID 中取回计数器；格式不符时返回 `None`。
    pub fn counter_from_communication_id(&self, communication_id: &str) -> Option<u32> {
        communication_id
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('{')?
            .strip_suffix('}')?
            .parse()
            .ok()
    }

    /// 按本编解码器的分片上限切分消息，见 [`split_by_length`]。
    pub fn split<'a>(&self, payload: &'a str) -> Vec<&'a str> {
        split_by_length(payload, self.max_chunk_size)
    }

    /// 消息切分后的分片数（至少为 1）。
    pub fn chunk_count(&self, payload: &str) -> u32 {
        let chars = payload.chars().count();
        let parts = chars.div_ceil(self.max_chunk_size).max(1);
        u32::try_from(parts).unwrap_or(u32::MAX)
    }

    pub fn compose_chunk_name(&self, logical_id: &str, index: u32, total: u32) -> String {
        let sep = self.separator;
        format!("{logical_id}{sep}{index}{sep}{total}")
    }

    /// 解析分片名。
    ///
    /// 从右向左切分，因此逻辑 ID 本身可以包含分隔符（例如以 `_` 为分隔符时的进度消息名）。
    ///
    /// 返回值：
    /// - 序号/总数不是数字、总数为 0、序号越界或逻辑 ID 为空时返回 `None`
    pub fn parse_chunk_name<'a>(&self, name: &'a str) -> Option<ChunkName<'a>> {
        let mut parts = name.rsplitn(3, self.separator);
        let total: u32 = parts.next()?.parse().ok()?;
        let index: u32 = parts.next()?.parse().ok()?;
        let logical_id = parts.next()?;
        if logical_id.is_empty() || total == 0 || index == 0 || index > total {
            return None;
        }
        Some(ChunkName {
            logical_id,
            index,
            total,
        })
    }

    /// 生成某条消息全部分片的名称（序号 `1..=total`）。
    pub fn chunk_names(&self, logical_id: &str, total: u32) -> Vec<String> {
        (1..=total)
            .map(|index| self.compose_chunk_name(logical_id, index, total))
            .collect()
    }

    /// 将一条消息编码为 `(分片名, 分片内容)` 列表，按序号排列。
    pub fn encode(&self, logical_id: &str, payload: &str) -> Vec<(String, String)> {
        let chunks = self.split(payload);
        let total = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        chunks
            .into_iter()
            .zip(1..=total)
            .map(|(chunk, index)| (self.compose_chunk_name(logical_id, index, total), chunk.to_string()))
            .collect()
    }

    /// 将存储中读出的原始分片合并为完整消息。
    ///
    /// 规则：
    /// - 仅处理以 `<前缀>{` 开头且能解析的分片名
    /// - 以 `(逻辑ID, 总数)` 分组；同一逻辑 ID 存在多个总数（旧数据残留）时，
    ///   取分片齐全且总数最小的一组
    /// - 分片不齐的消息本轮不输出，等待后续轮询
    pub fn merge(&self, raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let start = self.message_id_start();
        let mut groups: BTreeMap<(&str, u32), BTreeMap<u32, &str>> = BTreeMap::new();
        for (name, value) in raw {
            if !name.starts_with(&start) {
                continue;
            }
            let Some(chunk) = self.parse_chunk_name(name) else {
                debug!(name = %name, "跳过无法解析的分片名");
                continue;
            };
            groups
                .entry((chunk.logical_id, chunk.total))
                .or_default()
                .insert(chunk.index, value.as_str());
        }

        let mut messages = BTreeMap::new();
        for ((logical_id, total), parts) in groups {
            if messages.contains_key(logical_id) {
                continue;
            }
            if parts.len() != total as usize {
                debug!(logical_id, have = parts.len(), total, "消息分片不完整，暂不合并");
                continue;
            }
            messages.insert(logical_id.to_string(), parts.into_values().collect::<String>());
        }
        messages
    }

    /// 进度消息名：`<通信ID>_Progress_<序列号>`。
    pub fn compose_progress_name(&self, communication_id: &str, sequence: u32) -> String {
        format!("{communication_id}{PROGRESS_MARKER}{sequence}")
    }

    /// 解析进度消息名，返回 `(通信ID, 序列号)`。
    pub fn parse_progress_name<'a>(&self, name: &'a str) -> Option<(&'a str, u32)> {
        let (communication_id, sequence) = name.rsplit_once(PROGRESS_MARKER)?;
        if communication_id.is_empty() {
            return None;
        }
        Some((communication_id, sequence.parse().ok()?))
    }

    pub fn is_progress_name(&self, name: &str) -> bool {
        self.parse_progress_name(name).is_some()
    }
}

/// 按字符数切分字符串（不会切断多字节字符）。
///
/// 空字符串返回一个空分片，保证空消息也能被写入并送达。
pub fn split_by_length(payload: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    if payload.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in payload.char_indices() {
        if count == max_chars {
            chunks.push(&payload[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    chunks.push(&payload[start..]);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_raw(entries: &[(String, String)]) -> BTreeMap<String, String> {
        entries.iter().cloned().collect()
    }

    /// 简单的确定性洗牌（线性同余），避免为测试引入随机数依赖。
    fn shuffled<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
        let mut out = items.to_vec();
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        for i in (1..out.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            out.swap(i, j);
        }
        out
    }

    #[test]
    fn example_2500_chars_produces_three_named_chunks() {
        let codec = MessageCodec::new("id", '_', 1000);
        let payload = "x".repeat(2500);
        let id = codec.communication_id(1);
        let encoded = codec.encode(&id, &payload);
        let names: Vec<&str> = encoded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["id{1}_1_3", "id{1}_2_3", "id{1}_3_3"]);
        assert_eq!(encoded[2].1.len(), 500);

        let merged = codec.merge(&to_raw(&encoded));
        assert_eq!(merged.get("id{1}").map(String::as_str), Some(payload.as_str()));
    }

    #[test]
    fn merge_withholds_message_until_every_chunk_is_present() {
        let codec = MessageCodec::new("id", '_', 1000);
        let payload = "y".repeat(2500);
        let encoded = codec.encode("id{1}", &payload);

        for missing in 0..encoded.len() {
            let partial: Vec<_> = encoded
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != missing)
                .map(|(_, e)| e.clone())
                .collect();
            assert!(codec.merge(&to_raw(&partial)).is_empty(), "chunk {missing} missing");
        }
        assert_eq!(codec.merge(&to_raw(&encoded)).len(), 1);
    }

    #[test]
    fn round_trip_is_independent_of_delivery_order() {
        let codec = MessageCodec::new(DEFAULT_PREFIX, DEFAULT_SEPARATOR, 7);
        let payloads = [
            String::new(),
            "a".to_string(),
            "exactly7".chars().take(7).collect::<String>(),
            "配置内容包含多字节字符，并且足够长以便切分成多个分片".to_string(),
            "{\"RequestId\":\"abc\",\"Configure\":\"properties:\\n  resources: []\"}".repeat(5),
        ];
        for (n, payload) in payloads.iter().enumerate() {
            let id = codec.communication_id(n as u32 + 1);
            let encoded = codec.encode(&id, payload);
            for seed in 0..8 {
                let order = shuffled(&encoded, seed);
                let merged = codec.merge(&to_raw(&order));
                assert_eq!(merged.get(&id), Some(payload), "payload #{n} seed {seed}");
            }
        }
    }

    #[test]
    fn split_respects_char_boundaries_and_limit() {
        let payload = "αβγδεζηθικ";
        let chunks = split_by_length(payload, 3);
        assert_eq!(chunks, vec!["αβγ", "δεζ", "ηθι", "κ"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
        assert_eq!(split_by_length("", 10), vec![""]);
        assert_eq!(split_by_length("abc", 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn chunk_count_matches_split() {
        let codec = MessageCodec::new("p", '~', 4);
        for s in ["", "a", "abcd", "abcde", "abcdefgh", "abcdefghi"] {
            assert_eq!(codec.chunk_count(s) as usize, codec.split(s).len(), "{s:?}");
        }
    }

    #[test]
    fn malformed_names_are_skipped() {
        let codec = MessageCodec::default();
        assert!(codec.parse_chunk_name("DevSetup{1}").is_none());
        assert!(codec.parse_chunk_name("DevSetup{1}~x~2").is_none());
        assert!(codec.parse_chunk_name("DevSetup{1}~0~2").is_none());
        assert!(codec.parse_chunk_name("DevSetup{1}~3~2").is_none());
        assert!(codec.parse_chunk_name("~1~1").is_none());

        let mut raw = BTreeMap::new();
        raw.insert("DevSetup{1}~garbage".to_string(), "x".to_string());
        raw.insert("Unrelated~1~1".to_string(), "x".to_string());
        raw.insert("DevSetup{2}~1~1".to_string(), "ok".to_string());
        let merged = codec.merge(&raw);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["DevSetup{2}"], "ok");
    }

    #[test]
    fn stale_chunks_with_other_total_do_not_corrupt_message() {
        let codec = MessageCodec::default();
        let mut raw = BTreeMap::new();
        // 上一次运行残留的一片（总数 3，不完整）
        raw.insert("DevSetup{4}~2~3".to_string(), "stale".to_string());
        raw.insert("DevSetup{4}~1~2".to_string(), "he".to_string());
        raw.insert("DevSetup{4}~2~2".to_string(), "llo".to_string());
        let merged = codec.merge(&raw);
        assert_eq!(merged["DevSetup{4}"], "hello");
    }

    #[test]
    fn progress_names_compose_and_parse() {
        let codec = MessageCodec::default();
        let name = codec.compose_progress_name("DevSetup{9}", 12);
        assert_eq!(name, "DevSetup{9}_Progress_12");
        assert_eq!(codec.parse_progress_name(&name), Some(("DevSetup{9}", 12)));
        assert!(codec.parse_progress_name("DevSetup{9}").is_none());
        assert!(codec.parse_progress_name("DevSetup{9}_Progress_x").is_none());

        // 以 '_' 为分隔符时，进度消息的分片名仍可被正确解析
        let underscore = MessageCodec::new("id", '_', 1000);
        let chunk = underscore.compose_chunk_name(&name, 1, 1);
        let parsed = underscore.parse_chunk_name(&chunk).unwrap();
        assert_eq!(parsed.logical_id, name);
    }

    #[test]
    fn communication_id_counter_round_trip() {
        let codec = MessageCodec::default();
        let id = codec.communication_id(4_000_000_000);
        assert_eq!(id, "DevSetup{4000000000}");
        assert_eq!(codec.counter_from_communication_id(&id), Some(4_000_000_000));
        assert_eq!(codec.counter_from_communication_id("DevSetup{x}"), None);
        assert_eq!(codec.counter_from_communication_id("Other{1}"), None);
    }
}

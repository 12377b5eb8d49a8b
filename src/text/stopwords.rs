//! Built-in stop words for keyword queries (English and Chinese)

pub(crate) const STOP_WORDS: &[&str] = &[
    // English
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "can", "this", "that", "these",
    "those", "it", "its", "what", "which", "who", "when", "where", "why", "how",
    // Chinese
    "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "一个", "上", "也",
    "很", "到", "说", "要", "去", "你", "会", "着", "没有", "看", "与", "如何", "为", "得",
    "里", "后", "自己", "之", "过", "给", "然后", "那", "下", "能", "而", "来", "个", "这",
    "之间", "应该", "可以", "由", "及", "对", "中", "但", "年", "还", "并", "如果", "我们",
    "为了", "而且", "或者", "因为", "所以", "对于", "而言", "与否", "只是", "已经", "可能",
    "同时", "比如", "这样", "当然", "并且", "大家", "之后", "那么", "越", "虽然", "比", "还是",
    "只有", "现在", "由于", "尽管", "除了", "以外", "然而", "哪些", "这些", "所有", "并非",
    "例如", "尤其", "哪里", "那里", "何时", "多少", "以至", "以至于", "几乎", "仍然", "甚至",
    "更加", "无论", "不过", "不是", "从来", "何处", "到底", "何况", "不会", "何以", "怎样",
    "为何", "此外", "其中", "怎么", "什么", "为什么", "是否",
];

/// Grammatical particles that never start or end a meaningful CJK bigram
pub(crate) const CJK_PARTICLES: &[char] = &['的', '了', '着', '吗', '呢', '吧', '啊', '么'];

//! 各语言的区块标题与分类标签

use crate::core::Language;
use crate::memory::{MemoryCategory, SubCategory};

pub struct SectionLabels {
    /// 今日记忆区块标题
    pub today_header: &'static str,
    /// 历史记忆区块标题，`{days}` 会被替换为天数
    pub history_header: &'static str,
    /// 今日记忆行里的分类名
    pub user_fact: &'static str,
    pub event: &'static str,
    /// 每日总结输入：昨日记忆标题与分类括号
    pub yesterday_header: &'static str,
    pub user_fact_bracket: &'static str,
    pub event_bracket: &'static str,
    /// 背景事件区块标题
    pub events_header: &'static str,
    /// 角色信息：标题 + 昵称、性别、年龄、身份、简介、性格
    pub role_header: &'static str,
    pub role_fields: [&'static str; 6],
    /// 用户背景：标题 + 性别、描述、称呼、喜欢、不喜欢、其它
    pub user_header: &'static str,
    pub user_fields: [&'static str; 6],
    pub date_label: &'static str,
    pub status_line: &'static str,
}

static ZH_HANT: SectionLabels = SectionLabels {
    today_header: "###今日記憶：",
    history_header: "###最近{days}天記憶：",
    user_fact: "用戶資料",
    event: "重要事件",
    yesterday_header: "昨日记忆内容：",
    user_fact_bracket: "【用户资料】",
    event_bracket: "【重要事件】",
    events_header: "###角色事件：",
    role_header: "###角色訊息",
    role_fields: ["角色昵稱", "角色性別", "角色年齡", "角色身份", "角色簡介", "性格習慣"],
    user_header: "###用戶背景：",
    user_fields: ["用戶性别", "用戶描述", "角色称呼用户", "用戶喜欢", "用戶不喜欢", "其它"],
    date_label: "###当前日期：",
    status_line: "#在每个会话结尾添加下面的格式内容：",
};

static EN: SectionLabels = SectionLabels {
    today_header: "###Today's Memories:",
    history_header: "###Memories from the last {days} days:",
    user_fact: "User Profile",
    event: "Important Event",
    yesterday_header: "Yesterday's Memories:",
    user_fact_bracket: "【User Profile】",
    event_bracket: "【Important Event】",
    events_header: "###Role Events:",
    role_header: "###Character",
    role_fields: ["Name", "Gender", "Age", "Occupation", "Description", "Personality"],
    user_header: "###User Background:",
    user_fields: ["Gender", "Description", "Called by the character", "Likes", "Dislikes", "Other"],
    date_label: "###Current date: ",
    status_line: "#Append the following status block at the end of every reply: ",
};

pub fn labels(language: Language) -> &'static SectionLabels {
    match language {
        Language::TraditionalChinese => &ZH_HANT,
        Language::English => &EN,
    }
}

impl SectionLabels {
    pub fn history_header(&self, days: usize) -> String {
        self.history_header.replace("{days}", &days.to_string())
    }

    pub fn category(&self, category: MemoryCategory) -> &'static str {
        match category {
            MemoryCategory::UserFact => self.user_fact,
            MemoryCategory::Event => self.event,
        }
    }

    pub fn bracket(&self, sub: SubCategory) -> &'static str {
        match sub.category() {
            MemoryCategory::UserFact => self.user_fact_bracket,
            MemoryCategory::Event => self.event_bracket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_header_substitution() {
        assert_eq!(labels(Language::TraditionalChinese).history_header(7), "###最近7天記憶：");
        assert_eq!(
            labels(Language::English).history_header(3),
            "###Memories from the last 3 days:"
        );
    }
}

//! Prompt construction for the agent runtime.
//!
//! The agents operate in Japanese. All prompts embed the chatlog contract:
//! the agent speaks by appending one formatted line to the chatlog file via
//! a shell command, and is expected to keep watching for mentions.

use std::path::Path;

use crate::chatlog::Message;

use super::id::{AgentId, AgentRole};

/// Fixed prompt sent when a backend reports the tool loop was cut off.
pub const CONTINUATION_PROMPT: &str =
    "作業の途中で中断されました。現在のディレクトリの状態を確認し、中断した作業を再開してください。";

/// Fixed prompt that asks the model to distill its state before a reset.
pub const DISTILLATION_PROMPT: &str = "\
まもなくコンテキストをリセットします。現在の作業状況を、次の 4 行の形式だけで出力してください。
STATE: 現在の状態
DECISIONS: これまでに決めたこと
OPEN: 未解決の課題
NEXT: 次にやること";

const SUPERINTENDENT_PREAMBLE: &str = "\
あなたは開発チーム全体を統括する superintendent です。
チャットログを通じて orchestrator と各チームの engineer に指示を出し、issue の進行を管理します。
チームを作るときは「TEAM_CREATE <issue-id>」、解散するときは「TEAM_DISBAND <issue-id>」を @orchestrator 宛に送ってください。
新しい issue を登録するときは「ISSUE_CREATE <タイトル> | <本文>」を使います。
engineer からの報告には必ず返信し、完了した issue は解散を指示してください。";

const ENGINEER_PREAMBLE: &str = "\
あなたはチームに所属する engineer です。
superintendent から割り当てられた issue を、作業ディレクトリ内で実装してください。
進捗・質問・完了報告はチャットログで @superintendent 宛に送ります。";

/// The role preamble used in the initial prompt.
pub fn role_preamble(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Superintendent => SUPERINTENDENT_PREAMBLE,
        AgentRole::Engineer => ENGINEER_PREAMBLE,
    }
}

/// Build the initial prompt sent on startup and after every context reset.
///
/// The closing directive depends on whether an original task exists: with a
/// task the agent must start working immediately (its assignment notice may
/// arrive out of order, or not at all after a restart); without one it waits
/// for mentions.
pub fn build_initial_prompt(
    preamble: &str,
    agent_id: &AgentId,
    chatlog_path: &Path,
    task: Option<&str>,
    memo: &str,
) -> String {
    let mut prompt = String::from(preamble);
    prompt.push('\n');

    if let Some(task) = task.filter(|t| !t.is_empty()) {
        prompt.push_str("\n元の依頼内容:\n");
        prompt.push_str(task);
        prompt.push('\n');
    }

    if !memo.is_empty() {
        prompt.push_str("\n直近の作業メモ:\n");
        prompt.push_str(memo);
        prompt.push('\n');
    }

    let path = chatlog_path.display();
    prompt.push_str(&format!(
        "\nチャットログ: {path}\n発言するときは、次の形式のコマンドを実行してください:\n\
         echo \"[$(date +%Y-%m-%dT%H:%M:%S)] [@宛先] {agent_id}: 本文\" >> {path}\n"
    ));

    if task.map_or(false, |t| !t.is_empty()) {
        prompt.push_str(&format!(
            "\nまず上記の依頼内容の実装に直ちに着手してください。\
             作業中もチャットログで自分宛 (@{agent_id}) のメッセージに都度対応してください。"
        ));
    } else {
        prompt.push_str(&format!(
            "\n現在は待機モードです。チャットログで自分宛 (@{agent_id}) のメッセージを待ち、\
             指示が来たら対応してください。"
        ));
    }

    prompt
}

/// Build the composite prompt for a coalesced batch of incoming messages.
/// Every message is quoted verbatim so nothing is lost in summarization.
pub fn build_message_prompt(messages: &[Message]) -> String {
    let mut prompt =
        String::from("チャットログに新しいメッセージが届いています。それぞれに対応してください。\n");
    for msg in messages {
        prompt.push_str("\n> ");
        prompt.push_str(&msg.raw);
    }
    prompt
}

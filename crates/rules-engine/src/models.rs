//! 规则引擎领域模型

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// 未指定租户时资产所属的默认租户
pub const DEFAULT_REALM: &str = "master";

// ==================== 规则集 ====================

/// 规则集部署状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    #[default]
    Ready,
    Deployed,
    Failed,
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "READY"),
            Self::Deployed => write!(f, "DEPLOYED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// 规则集作用域
///
/// 每个作用域拥有一个独立的引擎实例
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RulesetScope {
    Global,
    Tenant {
        realm: String,
    },
    Asset {
        realm: String,
        #[serde(rename = "assetId")]
        asset_id: String,
    },
}

impl RulesetScope {
    pub fn tenant(realm: impl Into<String>) -> Self {
        Self::Tenant {
            realm: realm.into(),
        }
    }

    pub fn asset(realm: impl Into<String>, asset_id: impl Into<String>) -> Self {
        Self::Asset {
            realm: realm.into(),
            asset_id: asset_id.into(),
        }
    }

    /// 校验作用域标识，租户或资产标识为空时视为非法输入
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Global => Ok(()),
            Self::Tenant { realm } => {
                if realm.trim().is_empty() {
                    return Err(RuleError::InvalidInput("租户作用域的 realm 不能为空".to_string()));
                }
                Ok(())
            }
            Self::Asset { realm, asset_id } => {
                if realm.trim().is_empty() {
                    return Err(RuleError::InvalidInput("资产作用域的 realm 不能为空".to_string()));
                }
                if asset_id.trim().is_empty() {
                    return Err(RuleError::InvalidInput(
                        "资产作用域的 assetId 不能为空".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for RulesetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Tenant { realm } => write!(f, "tenant:{}", realm),
            Self::Asset { realm, asset_id } => write!(f, "asset:{}/{}", realm, asset_id),
        }
    }
}

/// 规则集定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ruleset {
    pub id: i64,
    pub name: String,
    pub scope: RulesetScope,
    pub version: i64,
    /// 规则文本，编译后不再保留
    #[serde(default)]
    pub rules: Option<String>,
    #[serde(default)]
    pub template_asset_id: Option<String>,
    #[serde(default)]
    pub status: DeploymentStatus,
}

/// 规则集文件格式，`rules` 可以是字符串也可以是内联的规则文档
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RulesetFile {
    id: i64,
    name: String,
    #[serde(default = "default_scope")]
    scope: RulesetScope,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    rules: Option<Value>,
    #[serde(default)]
    template_asset_id: Option<String>,
}

fn default_scope() -> RulesetScope {
    RulesetScope::Global
}

impl Ruleset {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        scope: RulesetScope,
        version: i64,
        rules: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            scope,
            version,
            rules: Some(rules.into()),
            template_asset_id: None,
            status: DeploymentStatus::Ready,
        }
    }

    pub fn with_template(mut self, template_asset_id: impl Into<String>) -> Self {
        self.template_asset_id = Some(template_asset_id.into());
        self
    }

    /// 从规则集文件内容解析
    pub fn from_json(json: &str) -> Result<Self> {
        let file: RulesetFile = serde_json::from_str(json)?;
        let rules = match file.rules {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) => Some(text),
            Some(document) => Some(document.to_string()),
        };

        Ok(Self {
            id: file.id,
            name: file.name,
            scope: file.scope,
            version: file.version,
            rules,
            template_asset_id: file.template_asset_id,
            status: DeploymentStatus::Ready,
        })
    }

    pub fn summary(&self) -> RulesetSummary {
        RulesetSummary {
            id: self.id,
            name: self.name.clone(),
            version: self.version,
            status: self.status,
        }
    }
}

/// 规则集状态摘要（不包含规则文本）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RulesetSummary {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub status: DeploymentStatus,
}

/// 引擎状态查询结果
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub scope: RulesetScope,
    pub running: bool,
    pub error: Option<RuleError>,
    pub rulesets: Vec<RulesetSummary>,
}

impl EngineStatus {
    pub fn ruleset(&self, id: i64) -> Option<&RulesetSummary> {
        self.rulesets.iter().find(|r| r.id == id)
    }
}

// ==================== 事实 ====================

/// 资产属性标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeRef {
    pub asset_id: String,
    pub attribute_name: String,
}

impl AttributeRef {
    pub fn new(asset_id: impl Into<String>, attribute_name: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            attribute_name: attribute_name.into(),
        }
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.asset_id, self.attribute_name)
    }
}

/// 资产属性状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetState {
    pub asset_id: String,
    #[serde(default)]
    pub asset_name: String,
    #[serde(default)]
    pub asset_type: String,
    pub realm: String,
    /// 祖先资产 ID，根在前
    #[serde(default)]
    pub parent_path: Vec<String>,
    pub attribute_name: String,
    pub value: Value,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl AssetState {
    pub fn new(
        asset_id: impl Into<String>,
        attribute_name: impl Into<String>,
        value: impl Into<Value>,
        timestamp: i64,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            asset_name: String::new(),
            asset_type: String::new(),
            realm: DEFAULT_REALM.to_string(),
            parent_path: Vec::new(),
            attribute_name: attribute_name.into(),
            value: value.into(),
            timestamp,
        }
    }

    pub fn in_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.asset_name = name.into();
        self
    }

    pub fn with_type(mut self, asset_type: impl Into<String>) -> Self {
        self.asset_type = asset_type.into();
        self
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parent_path = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn attribute_ref(&self) -> AttributeRef {
        AttributeRef::new(&self.asset_id, &self.attribute_name)
    }

    /// 资产自身或其祖先是否为指定资产
    pub fn is_within(&self, asset_id: &str) -> bool {
        self.asset_id == asset_id || self.parent_path.iter().any(|p| p == asset_id)
    }
}

/// 资产事件：带有有效期的属性状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetEvent {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: AssetState,
    /// 插入时会话时钟的毫秒时间
    pub inserted_at: i64,
}

impl AssetEvent {
    pub fn new(state: AssetState, inserted_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            inserted_at,
        }
    }
}

/// 事实类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    AssetState,
    AssetEvent,
    Custom,
}

impl FactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssetState => "asset_state",
            Self::AssetEvent => "asset_event",
            Self::Custom => "custom",
        }
    }
}

/// 工作内存中的事实
#[derive(Debug, Clone, PartialEq)]
pub enum Fact {
    State(AssetState),
    Event(AssetEvent),
    Custom(Value),
}

/// 事实 JSON 投影中标识事实类型的字段
pub const FACT_TYPE_FIELD: &str = "factType";

impl Fact {
    pub fn kind(&self) -> FactKind {
        match self {
            Self::State(_) => FactKind::AssetState,
            Self::Event(_) => FactKind::AssetEvent,
            Self::Custom(_) => FactKind::Custom,
        }
    }

    /// 生成用于条件评估的 JSON 投影
    pub fn to_json(&self) -> Value {
        let mut projected = match self {
            Self::State(state) => serde_json::to_value(state).unwrap_or(Value::Null),
            Self::Event(event) => serde_json::to_value(event).unwrap_or(Value::Null),
            Self::Custom(Value::Object(map)) => Value::Object(map.clone()),
            Self::Custom(other) => serde_json::json!({ "value": other }),
        };

        if let Value::Object(map) = &mut projected {
            map.entry(FACT_TYPE_FIELD)
                .or_insert_with(|| Value::String(self.kind().as_str().to_string()));
        }
        projected
    }

    pub fn as_state(&self) -> Option<&AssetState> {
        match self {
            Self::State(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&AssetEvent> {
        match self {
            Self::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// 工作内存中事实的不透明句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FactHandle(pub u64);

impl fmt::Display for FactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 工作内存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FactStats {
    pub total: usize,
    pub states: usize,
    pub events: usize,
    pub custom: usize,
}

impl FactStats {
    pub fn record(&mut self, kind: FactKind) {
        self.total += 1;
        match kind {
            FactKind::AssetState => self.states += 1,
            FactKind::AssetEvent => self.events += 1,
            FactKind::Custom => self.custom += 1,
        }
    }
}

/// 引擎跟踪的属性状态及其同步情况
#[derive(Debug, Clone, PartialEq)]
pub struct FactSnapshot {
    pub state: AssetState,
    /// 当前是否已插入运行中的会话
    pub synchronized: bool,
}

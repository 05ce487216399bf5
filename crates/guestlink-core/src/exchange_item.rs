//! Hyper-V 数据交换条目（`Msvm_KvpExchangeDataItem`）的 CIM-XML 表示。
//!
//! 主机侧添加/删除条目时以嵌入实例的文本形式传入，读取 `GuestExchangeItems` 时得到的也是同样的文本：
//!
//! ```text
//! <INSTANCE CLASSNAME="Msvm_KvpExchangeDataItem">
//!   <PROPERTY NAME="Data" TYPE="string"><VALUE>...</VALUE></PROPERTY>
//!   <PROPERTY NAME="Name" TYPE="string"><VALUE>...</VALUE></PROPERTY>
//!   <PROPERTY NAME="Source" TYPE="uint16"><VALUE>0</VALUE></PROPERTY>
//! </INSTANCE>
//! ```
//!
//! 作者：GuestLink 项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// `Source` 取值：主机写入的条目。
pub const SOURCE_HOST: u16 = 0;

#[derive(Debug, Error)]
pub enum ExchangeItemError {
    #[error("解析 CIM-XML 失败: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("数据交换条目缺少 Name 属性")]
    MissingName,
}

/// 一个数据交换条目。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeItem {
    pub name: String,
    pub data: String,
    pub source: u16,
}

impl ExchangeItem {
    pub fn host(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            source: SOURCE_HOST,
        }
    }

    /// 生成嵌入实例文本。
    pub fn to_cim_xml(&self) -> String {
        format!(
            concat!(
                r#"<INSTANCE CLASSNAME="Msvm_KvpExchangeDataItem">"#,
                r#"<PROPERTY NAME="Data" TYPE="string"><VALUE>{data}</VALUE></PROPERTY>"#,
                r#"<PROPERTY NAME="Name" TYPE="string"><VALUE>{name}</VALUE></PROPERTY>"#,
                r#"<PROPERTY NAME="Source" TYPE="uint16"><VALUE>{source}</VALUE></PROPERTY>"#,
                "</INSTANCE>"
            ),
            data = escape(self.data.as_str()),
            name = escape(self.name.as_str()),
            source = self.source,
        )
    }

    /// 解析嵌入实例文本。
    ///
    /// 异常处理：
    /// - XML 格式错误返回 [`ExchangeItemError::Xml`]
    /// - 不含 `Name` 属性值返回 [`ExchangeItemError::MissingName`]；`Data` 缺失按空字符串处理
    pub fn from_cim_xml(xml: &str) -> Result<Self, ExchangeItemError> {
        let mut reader = Reader::from_str(xml);
        let mut property: Option<String> = None;
        let mut value: Option<String> = None;
        let mut name = None;
        let mut data = None;
        let mut source = SOURCE_HOST;

        loop {
            match reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == b"PROPERTY" => {
                    property = match e.try_get_attribute("NAME")? {
                        Some(attr) => Some(attr.unescape_value()?.into_owned()),
                        None => None,
                    };
                }
                Event::Start(e) if e.name().as_ref() == b"VALUE" => {
                    value = Some(String::new());
                }
                Event::Empty(e) if e.name().as_ref() == b"VALUE" => {
                    assign(property.as_deref(), String::new(), &mut name, &mut data, &mut source);
                }
                Event::Text(t) => {
                    if let Some(buf) = value.as_mut() {
                        buf.push_str(&t.unescape()?);
                    }
                }
                Event::CData(t) => {
                    if let Some(buf) = value.as_mut() {
                        buf.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Event::End(e) if e.name().as_ref() == b"VALUE" => {
                    if let Some(text) = value.take() {
                        assign(property.as_deref(), text, &mut name, &mut data, &mut source);
                    }
                }
                Event::End(e) if e.name().as_ref() == b"PROPERTY" => {
                    property = None;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            name: name.ok_or(ExchangeItemError::MissingName)?,
            data: data.unwrap_or_default(),
            source,
        })
    }
}

fn assign(
    property: Option<&str>,
    text: String,
    name: &mut Option<String>,
    data: &mut Option<String>,
    source: &mut u16,
) {
    match property {
        Some("Name") => *name = Some(text),
        Some("Data") => *data = Some(text),
        Some("Source") => *source = text.trim().parse().unwrap_or(SOURCE_HOST),
        _ => {}
    }
}

pub mod llm;
pub mod models;
pub mod probe;
pub mod telemetry;
pub mod template;
pub mod thinking;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::llm;
    pub use crate::models;
    pub use crate::probe;
    pub use crate::telemetry;
    pub use crate::template;
    pub use crate::thinking;
}

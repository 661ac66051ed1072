//! Rendering - materialize a checked output plan
//!
//! Templates may emit further files through the `emit` helper. Those paths
//! are only known at render time, so each one goes through the same path
//! rules and a second collision check before it is written.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use handlebars::{
    Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext, RenderError,
    RenderErrorReason, Renderable,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::{BuildError, Result};
use crate::hashing::sha256_hex;
use crate::output::{resolve_output_path, ClaimOrigin, Collision, CollisionTracker, OutputClaim, OutputPlan};
use crate::snapshot::CanonicalSnapshot;
use crate::templates::TemplateSet;

/// A file requested from inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFile {
    pub filename: String,
    pub content: String,
}

type EmitSink = Arc<Mutex<Vec<EmittedFile>>>;

fn helper_error(message: impl Into<String>) -> RenderError {
    RenderErrorReason::Other(message.into()).into()
}

/// `{{emit "name.txt" content}}` or `{{#emit "name.txt"}}...{{/emit}}`.
struct EmitHelper {
    sink: EmitSink,
}

impl HelperDef for EmitHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        r: &'reg Handlebars<'reg>,
        ctx: &'rc Context,
        rc: &mut RenderContext<'reg, 'rc>,
        _out: &mut dyn Output,
    ) -> HelperResult {
        let filename = h
            .param(0)
            .and_then(|v| v.value().as_str())
            .ok_or_else(|| helper_error("emit requires a filename as its first parameter"))?
            .to_string();

        let content = match h.template() {
            Some(block) => block.renders(r, ctx, rc)?,
            None => match h.param(1).map(|v| v.value()) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => serde_json::to_string_pretty(other).map_err(|e| helper_error(e.to_string()))?,
                None => String::new(),
            },
        };

        let mut sink = self
            .sink
            .lock()
            .map_err(|_| helper_error("emit sink poisoned"))?;
        sink.push(EmittedFile { filename, content });
        Ok(())
    }
}

fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if let Some(v) = h.param(0) {
        out.write(&serde_json::to_string(v.value()).unwrap_or_default())?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrittenFile {
    pub path: PathBuf,
    pub template: String,
    pub instance_id: String,
    pub origin: ClaimOrigin,
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderSummary {
    pub written: Vec<WrittenFile>,
    pub collisions: Vec<Collision>,
}

pub struct Renderer {
    handlebars: Handlebars<'static>,
    sink: EmitSink,
    build_root: PathBuf,
    strict_collisions: bool,
}

impl Renderer {
    /// Compile every template up front; a template that fails to compile
    /// aborts before anything is rendered.
    pub fn new(templates: &TemplateSet, build_root: &Path, strict_collisions: bool) -> Result<Self> {
        let sink: EmitSink = Arc::default();
        let mut handlebars = Handlebars::new();
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("emit", Box::new(EmitHelper { sink: sink.clone() }));

        for template in templates.list() {
            handlebars
                .register_template_string(&template.key, &template.source)
                .map_err(|e| BuildError::Template {
                    template: template.key.clone(),
                    message: e.to_string(),
                })?;
        }

        Ok(Self {
            handlebars,
            sink,
            build_root: build_root.to_path_buf(),
            strict_collisions,
        })
    }

    /// Render one template and collect whatever it emitted.
    pub fn render_template(&self, key: &str, context: &Value) -> Result<(String, Vec<EmittedFile>)> {
        self.drain_sink()?;
        let text = self
            .handlebars
            .render(key, context)
            .map_err(|e| BuildError::Template {
                template: key.to_string(),
                message: e.to_string(),
            })?;
        Ok((text, self.drain_sink()?))
    }

    fn drain_sink(&self) -> Result<Vec<EmittedFile>> {
        let mut sink = self.sink.lock().map_err(|_| BuildError::Template {
            template: "emit".to_string(),
            message: "emit sink poisoned".to_string(),
        })?;
        Ok(std::mem::take(&mut *sink))
    }

    /// Render every planned output in order. Emitted files are resolved and
    /// collision-checked as they appear. Under strict collisions the first
    /// clash stops the pass; files already written stay in place.
    pub fn render_plan(&self, snapshot: &CanonicalSnapshot, plan: &OutputPlan) -> Result<RenderSummary> {
        let base = snapshot.to_value()?;
        let mut tracker = CollisionTracker::from_plan(plan);
        let mut summary = RenderSummary::default();

        for output in &plan.outputs {
            let instance = snapshot
                .instance(&output.instance_id)
                .ok_or_else(|| BuildError::Merge(format!("planned instance `{}` is missing", output.instance_id)))?;

            let mut context = base.clone();
            if let Value::Object(map) = &mut context {
                map.insert("instance".to_string(), instance.to_document());
                map.insert("template".to_string(), Value::String(output.template.clone()));
                map.insert("outputPath".to_string(), Value::String(self.relative(&output.path)));
            }

            let (text, emitted) = self.render_template(&output.template, &context)?;
            summary.written.push(self.write(&output.path, &text, &output.template, &output.instance_id, ClaimOrigin::Directive)?);

            for file in emitted {
                let path = resolve_output_path(&output.template, &file.filename, &self.build_root).map_err(|source| {
                    BuildError::OutputPath {
                        template: output.template.clone(),
                        instance: output.instance_id.clone(),
                        source,
                    }
                })?;
                let claim = OutputClaim {
                    template: output.template.clone(),
                    instance_id: output.instance_id.clone(),
                    origin: ClaimOrigin::Emitted,
                };
                if let Some(collision) = tracker.claim(&path, claim) {
                    log::warn!("emitted file collision: {collision}");
                    if self.strict_collisions {
                        return Err(BuildError::Collision(collision));
                    }
                    summary.collisions.push(collision);
                }
                summary.written.push(self.write(&path, &file.content, &output.template, &output.instance_id, ClaimOrigin::Emitted)?);
            }
        }

        log::info!("rendered {} file(s)", summary.written.len());
        Ok(summary)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.build_root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn write(
        &self,
        path: &Path,
        content: &str,
        template: &str,
        instance_id: &str,
        origin: ClaimOrigin,
    ) -> Result<WrittenFile> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| BuildError::io(path, e))?;
        log::debug!("wrote {}", path.display());
        Ok(WrittenFile {
            path: path.to_path_buf(),
            template: template.to_string(),
            instance_id: instance_id.to_string(),
            origin,
            hash: sha256_hex(content.as_bytes()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer(templates: &[(&str, &str)]) -> Renderer {
        let mut set = TemplateSet::new();
        for (key, source) in templates {
            set.register(*key, *source);
        }
        Renderer::new(&set, Path::new("/build"), false).unwrap()
    }

    #[test]
    fn test_render_with_context() {
        let r = renderer(&[("page.html", "<h1>{{instance.title}}</h1>{{json instance.tags}}")]);
        let (text, emitted) = r
            .render_template("page.html", &json!({"instance": {"title": "Hi", "tags": ["a"]}}))
            .unwrap();
        assert_eq!(text, r#"<h1>Hi</h1>["a"]"#);
        assert!(emitted.is_empty());
    }

    #[test]
    fn test_emit_inline_and_block() {
        let r = renderer(&[(
            "feed",
            r#"{{emit "a.txt" instance.body}}{{#emit "b.txt"}}B:{{instance.body}}{{/emit}}done"#,
        )]);
        let (text, emitted) = r.render_template("feed", &json!({"instance": {"body": "x"}})).unwrap();
        assert_eq!(text, "done");
        assert_eq!(
            emitted,
            vec![
                EmittedFile { filename: "a.txt".into(), content: "x".into() },
                EmittedFile { filename: "b.txt".into(), content: "B:x".into() },
            ]
        );
    }

    #[test]
    fn test_emit_without_filename_fails() {
        let r = renderer(&[("bad", "{{emit}}")]);
        assert!(matches!(
            r.render_template("bad", &json!({})).unwrap_err(),
            BuildError::Template { .. }
        ));
    }

    #[test]
    fn test_broken_template_rejected_at_compile() {
        let mut set = TemplateSet::new();
        set.register("broken", "{{#if}}");
        let err = Renderer::new(&set, Path::new("/build"), false).err().unwrap();
        assert!(matches!(err, BuildError::Template { .. }));
    }
}

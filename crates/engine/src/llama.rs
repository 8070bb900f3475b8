//! llama.cpp backend (via `llama-cpp-2`).
//!
//! Model loading and generation run on tokio's blocking pool; both are
//! CPU bound and can take seconds.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::{
    find_stop_marker, Completion, CompletionRequest, ContextConfig, ContextHandle, EngineError,
    InferenceEngine,
};

struct LoadedModel {
    model: LlamaModel,
    template: LlamaChatTemplate,
    n_ctx: u32,
}

/// Inference engine backed by llama.cpp.
pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    contexts: Mutex<HashMap<Uuid, Arc<LoadedModel>>>,
}

impl LlamaEngine {
    /// Initialize the llama.cpp backend. Only one engine may exist per process.
    pub fn new() -> Result<Self, EngineError> {
        let backend = LlamaBackend::init().map_err(|e| EngineError::Backend(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
            contexts: Mutex::new(HashMap::new()),
        })
    }

    fn lookup(&self, id: Uuid) -> Result<Arc<LoadedModel>, EngineError> {
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownContext(id))
    }
}

#[async_trait]
impl InferenceEngine for LlamaEngine {
    async fn init_context(&self, config: ContextConfig) -> Result<ContextHandle, EngineError> {
        info!("Loading llama model from: {:?}", config.model_path);
        let backend = self.backend.clone();
        let model_path = config.model_path.clone();

        let loaded = tokio::task::spawn_blocking(move || load_model(&backend, &config))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))??;

        let handle = ContextHandle::new(model_path);
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), Arc::new(loaded));
        info!("Llama context {} initialized", handle.id());
        Ok(handle)
    }

    async fn release_all(&self) -> Result<(), EngineError> {
        let released: Vec<Arc<LoadedModel>> = self
            .contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, model)| model)
            .collect();
        debug!("Releasing {} llama context(s)", released.len());
        // An in-flight completion keeps its own Arc; weights are freed when it finishes.
        drop(released);
        Ok(())
    }

    async fn completion(
        &self,
        context: &ContextHandle,
        request: CompletionRequest,
    ) -> Result<Completion, EngineError> {
        let loaded = self.lookup(context.id())?;
        let backend = self.backend.clone();

        tokio::task::spawn_blocking(move || generate(&backend, &loaded, &request))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }
}

fn load_model(backend: &LlamaBackend, config: &ContextConfig) -> Result<LoadedModel, EngineError> {
    let mut params = LlamaModelParams::default().with_n_gpu_layers(config.n_gpu_layers);
    if config.use_mlock {
        params = params.with_use_mlock(true);
    }

    let model = LlamaModel::load_from_file(backend, &config.model_path, &params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

    let template = match model.chat_template(None) {
        Ok(template) => template,
        Err(_) => {
            warn!("Model has no embedded chat template, falling back to chatml");
            LlamaChatTemplate::new("chatml").map_err(|e| EngineError::ModelLoad(e.to_string()))?
        }
    };

    Ok(LoadedModel {
        model,
        template,
        n_ctx: config.n_ctx,
    })
}

fn generate(
    backend: &LlamaBackend,
    loaded: &LoadedModel,
    request: &CompletionRequest,
) -> Result<Completion, EngineError> {
    let inference = |e: &dyn std::fmt::Display| EngineError::Inference(e.to_string());

    let messages = request
        .messages
        .iter()
        .map(|m| LlamaChatMessage::new(m.role.to_string(), m.content.clone()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| inference(&e))?;

    let prompt = loaded
        .model
        .apply_chat_template(&loaded.template, &messages, true)
        .map_err(|e| inference(&e))?;
    let tokens = loaded
        .model
        .str_to_token(&prompt, AddBos::Never)
        .map_err(|e| inference(&e))?;

    let n_ctx = loaded.n_ctx as usize;
    if tokens.len() >= n_ctx {
        return Err(EngineError::Inference(format!(
            "Prompt is {} tokens, context window is {}",
            tokens.len(),
            n_ctx
        )));
    }

    let ctx_params = LlamaContextParams::default().with_n_ctx(NonZeroU32::new(loaded.n_ctx));
    let mut ctx = loaded
        .model
        .new_context(backend, ctx_params)
        .map_err(|e| inference(&e))?;

    let n_batch = ctx.n_batch() as usize;
    for chunk in tokens.chunks(n_batch.max(1)) {
        let mut batch = LlamaBatch::get_one(chunk).map_err(|e| inference(&e))?;
        ctx.decode(&mut batch).map_err(|e| inference(&e))?;
    }

    let max_output = (n_ctx - tokens.len()).min(request.n_predict as usize);
    let mut sampler = LlamaSampler::greedy();
    let mut decoder = encoding_rs::UTF_8.new_decoder();
    let mut output = String::new();

    for _ in 0..max_output {
        let token = sampler.sample(&ctx, -1);
        sampler.accept(token);

        if loaded.model.is_eog_token(token) {
            break;
        }

        let piece = loaded
            .model
            .token_to_piece(token, &mut decoder, true, None)
            .map_err(|e| inference(&e))?;
        output.push_str(&piece);

        if let Some(idx) = find_stop_marker(&output, &request.stop) {
            output.truncate(idx);
            break;
        }

        let next = [token];
        let mut batch = LlamaBatch::get_one(&next).map_err(|e| inference(&e))?;
        ctx.decode(&mut batch).map_err(|e| inference(&e))?;
    }

    debug!("Generated {} bytes", output.len());
    Ok(Completion {
        text: (!output.is_empty()).then_some(output),
    })
}

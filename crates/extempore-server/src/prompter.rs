// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use extempore_core::{SiteError, EXTENSION_JPG};
use extempore_genai::{ModelClient, ProgressFn};
use tokio::sync::Mutex;

use crate::file::{write_file_atomic, SiteDir};

pub(crate) const OUTLINE_TXT: &str = "outline.txt";

/// In-memory sentinel for a site whose topic failed the safety probe. Never
/// persisted to disk.
const UNSAFE_OUTLINE: &str = "UNSAFE";

const SAFETY_TEMPLATE: &str = r#"
If the following topic is appropriate for all ages and audiences, respond with the single word "SAFE": {{slug}}.
"#;

const OUTLINE_TEMPLATE: &str = r#"
You are a professional web designer. Create a concise outline in markdown format of a site for the topic "{{slug}}".

Construction rules:
- Do **not** reference any external resources (fonts, CDNs, embeds, etc.).
- No JavaScript or SVG.
- All images must be JPG.
- All <img> tags must have a width and height.
- In CSS any image use must include object-fit: cover.
- All links must be relative to the root and be a long, descriptive slug of the content (like company-owner-with-hat.jpg
  or goat-facts-continued.html).
- The site must display well on both desktop and mobile devices.
- Never use position: sticky;

The outline should include the following sections:
- **Site Name And Paragraph Summary** - a short description of the site and its purpose
- **Style guide** – typography (built-in font classes only), spacing, imagery tone, theme
- **Color scheme** – primary, secondary, accent, neutrals (name + hex)
- **Layout** – grid/flex description, breakpoints, reusable components
- **Site map** – unordered list of important pages with slug filenames
- **Key features** – bullet list
- **Reusable CSS/HTML snippet** – fenced code blocks showing the skeleton for nav, hero, article, and footer

Write clearly enough that different teammates could each build a page and the finished site will remain cohesive and
on-brand.Make sure you capture the essence of the topic in the design, be creative!
"#;

const HTML_TEMPLATE: &str = r#"
You are a professional web designer. Your colleague has produced a site outline for you to follow, and your task is to
produce a single HTML page {{slug}} within that site using that outline.

Construction rules:
- Do **not** reference any external resources (fonts, CDNs, embeds, etc.).
- No JavaScript or SVG.
- All images must be JPG.
- All <img> tags must have a width and height.
- In CSS any image use must include object-fit: cover.
- All links must be relative to the root and be a long, descriptive slug of the content (like company-owner-with-hat.jpg
  or goat-facts-continued.html).
- The site must display well on both desktop and mobile devices.
- Never use position: sticky;

The page YOU are producing is {{slug}}.

Here is the outline to help guide you in your design:

{{outline}}

Here are some other pages (non-exhaustive list) or images on the site you might consider using or linking to:

{{links}}
"#;

const IMAGE_TEMPLATE: &str = r#"
Create an image to be used on the web site {{site}}. The image you are creating is called {{slug}}.
"#;

/// Owns the one-shot site outline and builds per-slug generation prompts.
/// All callers serialize behind the outline lock until the first outline
/// exists; that is the design contract of the site.
pub struct Prompter {
    model: Arc<dyn ModelClient>,
    site_name: String,
    dir: SiteDir,
    outline: Mutex<String>,
}

impl Prompter {
    #[must_use]
    pub fn new(model: Arc<dyn ModelClient>, site_name: impl Into<String>, dir: SiteDir) -> Self {
        Self {
            model,
            site_name: site_name.into(),
            dir,
            outline: Mutex::new(String::new()),
        }
    }

    /// Build the generation prompt for `slug`, lazily materializing the site
    /// outline on first use. Fails with `Unsafe` once the safety probe has
    /// rejected the site topic.
    pub async fn prompt_for_slug(
        &self,
        slug: &str,
        links: &str,
        progress: &ProgressFn,
    ) -> Result<String, SiteError> {
        let mut outline = self.outline.lock().await;
        if outline.is_empty() {
            *outline = self.load_or_generate_outline(progress).await?;
        }

        if *outline == UNSAFE_OUTLINE {
            return Err(SiteError::unsafe_site());
        }

        if slug.ends_with(EXTENSION_JPG) {
            return Ok(IMAGE_TEMPLATE
                .replace("{{slug}}", slug)
                .replace("{{site}}", &self.site_name));
        }

        Ok(HTML_TEMPLATE
            .replace("{{slug}}", slug)
            .replace("{{outline}}", &outline)
            .replace("{{links}}", links))
    }

    async fn load_or_generate_outline(&self, progress: &ProgressFn) -> Result<String, SiteError> {
        let path = self.dir.join(OUTLINE_TXT)?;
        match std::fs::read_to_string(&path) {
            Ok(outline) => Ok(outline),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let outline = self.generate_outline(progress).await?;
                if outline != UNSAFE_OUTLINE {
                    write_file_atomic(&self.dir, OUTLINE_TXT, outline.as_bytes())?;
                }
                Ok(outline)
            }
            Err(err) => Err(SiteError::io(format!(
                "failed to read {OUTLINE_TXT}: {err}"
            ))),
        }
    }

    async fn generate_outline(&self, progress: &ProgressFn) -> Result<String, SiteError> {
        let safety_prompt = SAFETY_TEMPLATE.replace("{{slug}}", &self.site_name);
        let verdict = self
            .model
            .text(&safety_prompt, progress)
            .await
            .map_err(|err| SiteError::model(format!("safety assessment failed: {err}")))?;
        if verdict != "SAFE" {
            return Ok(UNSAFE_OUTLINE.to_string());
        }

        progress("\nGenerating outline...\n");

        let outline_prompt = OUTLINE_TEMPLATE.replace("{{slug}}", &self.site_name);
        let outline = self
            .model
            .text(&outline_prompt, progress)
            .await
            .map_err(|err| SiteError::model(format!("outline generation failed: {err}")))?;

        progress("\n");
        Ok(outline)
    }
}

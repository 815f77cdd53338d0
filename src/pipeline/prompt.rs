//! Instruction templates sent with the merged page image.
//!
//! All builders are pure: the same inputs always give the same text.

/// Placeholder value shown in the JSON example.
const EXAMPLE_VALUE: &str = "valeur...";

const CHECKBOX_RULES: &str = r#"- Si une case à cocher est cochée (symbole comme ☑, ✓, X, etc.), la valeur est "Oui".
- Si une case à cocher est vide, la valeur est "Non".
- Si une information textuelle n'est pas présente, la valeur doit être "Non renseigné" ou une chaîne vide."#;

const STRICT_OUTPUT: &str = "Ne retourne RIEN d'autre que l'objet JSON. Pas de texte explicatif, pas de markdown, juste le JSON.";

/// Prompt asking for one JSON object keyed exactly by `query_keys`.
///
/// Group options arrive here already expanded (`"Sexe: Homme"`), so each
/// becomes an independent yes/no key.
pub fn build_json_prompt(query_keys: &[String]) -> String {
    format!(
        r#"Tu es un expert en extraction de données sur des formulaires médicaux.
Analyse l'image fournie et extrais les informations pour les variables suivantes : {list}.

**TACHE FINALE :**
Ta réponse DOIT être un unique objet JSON valide.
Les clés de l'objet JSON DOIVENT correspondre EXACTEMENT aux noms des variables demandées dans la liste.
Pour chaque variable de la liste, trouve la valeur correspondante dans le document.
{CHECKBOX_RULES}

Voici un exemple de la structure JSON que tu dois retourner :
```json
{example}
```

{STRICT_OUTPUT}
"#,
        list = query_keys.join(", "),
        example = json_example(query_keys),
    )
}

/// Prompt asking for free `Champ: Valeur` lines. Field names are not
/// listed; the model labels what it sees.
pub fn build_line_prompt() -> String {
    format!(
        r#"Tu es un expert en extraction de données sur des formulaires médicaux.
Analyse l'image fournie et transcris chaque champ rempli du formulaire.

**Format de réponse :**
Une ligne par champ, sous la forme « Champ: Valeur ».
Utilise l'étiquette telle qu'elle est écrite sur le document.
{CHECKBOX_RULES}

**Exemple :**
Nom: Dupont
Prénom: Jean
Date de naissance: 12/03/1985
Fièvre: Oui
Toux: Non
Adresse: Non renseigné

Ne retourne RIEN d'autre que ces lignes.
"#
    )
}

/// Prompt asking the model to list the form's fields as
/// `{"variables": [...]}`.
pub fn build_detection_prompt() -> String {
    format!(
        r#"Tu es un expert en analyse de formulaires.
Analyse l'image fournie et identifie TOUS les champs de formulaire, les étiquettes de données, et les questions qui pourraient être des variables à extraire.

**Instructions :**
1.  Liste les noms de ces variables dans l'ordre où ils apparaissent sur le document, de haut en bas.
2.  Sois concis mais descriptif. Par exemple, "Date de naissance" est mieux que "Date".
3.  Ignore les instructions, les titres généraux du document ou les paragraphes de texte. Concentre-toi sur les paires clé-valeur.

**TACHE FINALE :**
Ta réponse DOIT être un unique objet JSON valide.
L'objet JSON doit avoir une seule clé nommée "variables".
La valeur de "variables" doit être une liste de chaînes de caractères, où chaque chaîne est un nom de variable détecté.

**Exemple de format de réponse :**
```json
{{
  "variables": [
    "Nom du patient",
    "Prénom du patient",
    "Date de naissance",
    "Sexe",
    "Symptôme principal",
    "Date d'apparition des symptômes",
    "Antécédents médicaux"
  ]
}}
```

{STRICT_OUTPUT}
"#
    )
}

/// Pretty JSON object mapping every key to the placeholder, in key order.
fn json_example(keys: &[String]) -> String {
    if keys.is_empty() {
        return "{}".to_string();
    }
    let value = serde_json::Value::String(EXAMPLE_VALUE.to_string());
    let entries: Vec<String> = keys
        .iter()
        .map(|key| format!("  {}: {value}", serde_json::Value::String(key.clone())))
        .collect();
    format!("{{\n{}\n}}", entries.join(",\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn json_prompt_lists_every_key_in_order() {
        let prompt = build_json_prompt(&keys(&["Nom", "Sexe: Homme", "Sexe: Femme"]));
        assert!(prompt.contains("variables suivantes : Nom, Sexe: Homme, Sexe: Femme."));

        let nom = prompt.find("\"Nom\": \"valeur...\"").unwrap();
        let homme = prompt.find("\"Sexe: Homme\": \"valeur...\"").unwrap();
        let femme = prompt.find("\"Sexe: Femme\": \"valeur...\"").unwrap();
        assert!(nom < homme && homme < femme);
    }

    #[test]
    fn json_prompt_example_is_valid_json() {
        let prompt = build_json_prompt(&keys(&["Nom", "Adresse \"principale\""]));
        let start = prompt.find("```json\n").unwrap() + "```json\n".len();
        let end = start + prompt[start..].find("\n```").unwrap();
        let example: serde_json::Value = serde_json::from_str(&prompt[start..end]).unwrap();
        assert_eq!(example["Adresse \"principale\""], "valeur...");
    }

    #[test]
    fn json_prompt_states_checkbox_rules() {
        let prompt = build_json_prompt(&keys(&["Toux"]));
        assert!(prompt.contains("la valeur est \"Oui\""));
        assert!(prompt.contains("la valeur est \"Non\""));
        assert!(prompt.contains("Non renseigné"));
        assert!(prompt.trim_end().ends_with("juste le JSON."));
    }

    #[test]
    fn prompts_are_deterministic() {
        let k = keys(&["Nom", "Age"]);
        assert_eq!(build_json_prompt(&k), build_json_prompt(&k));
        assert_eq!(build_line_prompt(), build_line_prompt());
        assert_eq!(build_detection_prompt(), build_detection_prompt());
    }

    #[test]
    fn line_prompt_does_not_enumerate_fields() {
        let prompt = build_line_prompt();
        assert!(prompt.contains("Champ: Valeur"));
        assert!(!prompt.contains("variables suivantes"));
    }

    #[test]
    fn detection_prompt_asks_for_variables_key() {
        let prompt = build_detection_prompt();
        assert!(prompt.contains("\"variables\": ["));
    }

    #[test]
    fn empty_example() {
        assert_eq!(json_example(&[]), "{}");
    }
}
